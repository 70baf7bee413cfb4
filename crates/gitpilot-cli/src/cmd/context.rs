use crate::output::print_json;
use anyhow::{anyhow, Context as _};
use clap::Subcommand;
use gitpilot_core::config::{Config, DEFAULT_REPOSITORY_ID};
use gitpilot_core::context::{build_commit_context, build_push_context};
use gitpilot_core::git::CommandGit;
use gitpilot_core::types::OperationOptions;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum ContextSubcommand {
    /// Staged files, staged diff and recent commits
    Commit {
        /// Repository context id from the config
        #[arg(long, default_value = DEFAULT_REPOSITORY_ID)]
        repo: String,
    },

    /// Push target, upstream tracking and unpushed commits
    Push {
        /// Repository context id from the config
        #[arg(long, default_value = DEFAULT_REPOSITORY_ID)]
        repo: String,
        /// Remote to push to (default: upstream, then origin, then first remote)
        #[arg(long)]
        remote: Option<String>,
        /// Branch to push (default: current branch)
        #[arg(long)]
        branch: Option<String>,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcmd: ContextSubcommand, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let rt = tokio::runtime::Runtime::new()?;
    let git = CommandGit::new();

    match subcmd {
        ContextSubcommand::Commit { repo } => {
            let cwd = repository(&config, root, &repo)?;
            let ctx = rt.block_on(build_commit_context(&git, &cwd))?;
            if json {
                print_json(&ctx)?;
            } else {
                print!("{}", ctx.preview());
                println!();
            }
        }
        ContextSubcommand::Push {
            repo,
            remote,
            branch,
        } => {
            let cwd = repository(&config, root, &repo)?;
            let options = OperationOptions {
                remote,
                branch,
                ..Default::default()
            };
            let ctx = rt.block_on(build_push_context(&git, &cwd, &options))?;
            if json {
                print_json(&ctx)?;
            } else {
                print!("{}", ctx.preview());
            }
        }
    }
    Ok(())
}

fn repository(config: &Config, root: &Path, id: &str) -> anyhow::Result<PathBuf> {
    let mut repos = config.repository_map(root);
    repos.remove(id).ok_or_else(|| {
        let mut known: Vec<_> = repos.into_keys().collect();
        known.sort();
        anyhow!(
            "unknown repository context '{id}' (configured: {})",
            known.join(", ")
        )
    })
}
