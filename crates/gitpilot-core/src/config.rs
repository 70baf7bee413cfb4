use crate::error::{GitPilotError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// QueueConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Terminal sessions kept in memory for status reporting.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_max_concurrent() -> usize {
    2
}

fn default_history_limit() -> usize {
    50
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            history_limit: default_history_limit(),
        }
    }
}

// ---------------------------------------------------------------------------
// LockConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_hold_timeout")]
    pub hold_timeout_secs: u64,
}

fn default_hold_timeout() -> u64 {
    600
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            hold_timeout_secs: default_hold_timeout(),
        }
    }
}

impl LockConfig {
    pub fn hold_timeout(&self) -> Duration {
        Duration::from_secs(self.hold_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// AgentConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_executable")]
    pub executable: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    #[serde(default = "default_allowed_tools")]
    pub allowed_tools: Vec<String>,
}

fn default_executable() -> String {
    "claude".to_string()
}

fn default_max_turns() -> u32 {
    30
}

fn default_agent_timeout() -> u64 {
    900
}

fn default_grace_period() -> u64 {
    5
}

fn default_allowed_tools() -> Vec<String> {
    ["Bash", "Read", "Glob", "Grep"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            model: None,
            max_turns: default_max_turns(),
            timeout_secs: default_agent_timeout(),
            grace_period_secs: default_grace_period(),
            allowed_tools: default_allowed_tools(),
        }
    }
}

impl AgentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

// ---------------------------------------------------------------------------
// RepositoryConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub id: String,
    /// Absolute, or relative to the project root.
    pub path: PathBuf,
}

pub const DEFAULT_REPOSITORY_ID: &str = "default";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub locks: LockConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repositories: Vec<RepositoryConfig>,
}

impl Config {
    /// Load `.gitpilot/config.yaml`. A missing file yields the defaults.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    /// Repository context ids mapped to working-tree paths. With no
    /// repositories configured, `root` itself is registered as `default`.
    pub fn repository_map(&self, root: &Path) -> HashMap<String, PathBuf> {
        if self.repositories.is_empty() {
            return HashMap::from([(DEFAULT_REPOSITORY_ID.to_string(), root.to_path_buf())]);
        }
        self.repositories
            .iter()
            .map(|r| {
                let path = if r.path.is_absolute() {
                    r.path.clone()
                } else {
                    root.join(&r.path)
                };
                (r.id.clone(), path)
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.queue.max_concurrent == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "queue.max_concurrent must be at least 1".into(),
            });
        } else if self.queue.max_concurrent > 8 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "queue.max_concurrent={} runs many agent processes at once",
                    self.queue.max_concurrent
                ),
            });
        }

        if self.locks.hold_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "locks.hold_timeout_secs must be greater than 0".into(),
            });
        } else if self.locks.hold_timeout_secs < self.agent.timeout_secs {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "locks.hold_timeout_secs ({}) is shorter than agent.timeout_secs ({}); \
                     long agent runs will lose their permit",
                    self.locks.hold_timeout_secs, self.agent.timeout_secs
                ),
            });
        }

        if self.agent.timeout_secs == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "agent.timeout_secs must be greater than 0".into(),
            });
        }

        if self.agent.executable.trim().is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "agent.executable is empty".into(),
            });
        } else if which::which(&self.agent.executable).is_err() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "agent executable '{}' not found on PATH; commit and create-pr will fail",
                    self.agent.executable
                ),
            });
        }

        let mut seen = HashSet::new();
        for repo in &self.repositories {
            if repo.id.trim().is_empty() {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("repository at '{}' has an empty id", repo.path.display()),
                });
            }
            if !seen.insert(repo.id.as_str()) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Error,
                    message: format!("duplicate repository id '{}'", repo.id),
                });
            }
        }

        warnings
    }

    /// Fail on the first error-level warning.
    pub fn ensure_valid(&self) -> Result<()> {
        match self
            .validate()
            .into_iter()
            .find(|w| w.level == WarnLevel::Error)
        {
            Some(w) => Err(GitPilotError::InvalidConfig(w.message)),
            None => Ok(()),
        }
    }
}
