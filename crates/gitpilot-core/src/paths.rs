use std::path::{Path, PathBuf};

pub const GITPILOT_DIR: &str = ".gitpilot";
pub const CONFIG_FILE: &str = ".gitpilot/config.yaml";

pub fn gitpilot_dir(root: &Path) -> PathBuf {
    root.join(GITPILOT_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}
