//! Git command layer.
//!
//! [`GitClient`] is the seam the rest of the crate talks to; [`CommandGit`]
//! implements it over the `git` CLI. Mutating methods take a [`Permit`] so a
//! commit or push cannot be issued without holding the repository's lock.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::error::{GitPilotError, Result};
use crate::lock::Permit;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
}

impl FileStatus {
    fn from_code(code: &str) -> Self {
        match code.chars().next() {
            Some('A') => FileStatus::Added,
            Some('D') => FileStatus::Deleted,
            _ => FileStatus::Modified,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedFile {
    pub path: String,
    pub status: FileStatus,
    pub additions: u32,
    pub deletions: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    pub hash: String,
    pub short_hash: String,
    pub subject: String,
    pub author: String,
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upstream {
    pub remote: String,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushStatus {
    pub branch: String,
    pub upstream: Option<Upstream>,
    pub ahead: u32,
    pub behind: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushArgs {
    pub remote: String,
    pub branch: String,
    pub force: bool,
    pub set_upstream: bool,
}

impl PushArgs {
    fn to_args(&self) -> Vec<&str> {
        let mut args = vec!["push"];
        if self.force {
            args.push("--force-with-lease");
        }
        if self.set_upstream {
            args.push("-u");
        }
        args.push("--");
        args.push(&self.remote);
        args.push(&self.branch);
        args
    }
}

/// Captured output of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

// ---------------------------------------------------------------------------
// GitClient
// ---------------------------------------------------------------------------

#[async_trait]
pub trait GitClient: Send + Sync {
    async fn staged_files(&self, cwd: &Path) -> Result<Vec<StagedFile>>;

    async fn staged_diff(&self, cwd: &Path) -> Result<String>;

    async fn current_branch(&self, cwd: &Path) -> Result<String>;

    async fn log(&self, cwd: &Path, limit: usize, offset: usize) -> Result<Vec<CommitInfo>>;

    async fn push_status(&self, cwd: &Path) -> Result<PushStatus>;

    /// Commits on HEAD not on the upstream, or on no remote at all when
    /// there is no upstream.
    async fn unpushed_commits(&self, cwd: &Path) -> Result<Vec<CommitInfo>>;

    async fn remotes(&self, cwd: &Path) -> Result<Vec<String>>;

    /// Full hash of HEAD; `None` before the first commit.
    async fn head(&self, cwd: &Path) -> Result<Option<String>>;

    /// Commit the index. Returns the new commit hash.
    async fn commit(&self, permit: &Permit, cwd: &Path, message: &str) -> Result<String>;

    async fn push(&self, permit: &Permit, cwd: &Path, args: &PushArgs) -> Result<CommandOutput>;
}

// ---------------------------------------------------------------------------
// CommandGit
// ---------------------------------------------------------------------------

/// [`GitClient`] over the `git` executable.
#[derive(Debug, Clone, Default)]
pub struct CommandGit;

impl CommandGit {
    pub fn new() -> Self {
        Self
    }
}

const LOG_FORMAT: &str = "--format=%H%x1f%h%x1f%s%x1f%an%x1f%aI";

#[async_trait]
impl GitClient for CommandGit {
    async fn staged_files(&self, cwd: &Path) -> Result<Vec<StagedFile>> {
        let (numstat, name_status) = tokio::try_join!(
            run_git(cwd, &["diff", "--cached", "--no-renames", "--numstat"]),
            run_git(cwd, &["diff", "--cached", "--no-renames", "--name-status"]),
        )?;
        let files = merge_staged(&numstat, &name_status);
        debug!(path = %cwd.display(), files_count = files.len(), "listed staged files");
        Ok(files)
    }

    async fn staged_diff(&self, cwd: &Path) -> Result<String> {
        Ok(run_git_output(cwd, &["diff", "--cached", "--no-renames"])
            .await?
            .stdout)
    }

    async fn current_branch(&self, cwd: &Path) -> Result<String> {
        // symbolic-ref also works before the first commit.
        match run_git(cwd, &["symbolic-ref", "--short", "-q", "HEAD"]).await {
            Ok(branch) if !branch.is_empty() => Ok(branch),
            _ => Ok("HEAD".to_string()),
        }
    }

    async fn log(&self, cwd: &Path, limit: usize, offset: usize) -> Result<Vec<CommitInfo>> {
        if self.head(cwd).await?.is_none() {
            return Ok(Vec::new());
        }
        let limit = format!("-n{limit}");
        let skip = format!("--skip={offset}");
        let out = run_git(cwd, &["log", LOG_FORMAT, &limit, &skip]).await?;
        Ok(parse_log(&out))
    }

    async fn push_status(&self, cwd: &Path) -> Result<PushStatus> {
        let branch = self.current_branch(cwd).await?;
        let upstream = upstream_of(cwd, &branch).await;
        if self.head(cwd).await?.is_none() {
            return Ok(PushStatus {
                branch,
                upstream,
                ahead: 0,
                behind: 0,
            });
        }

        let (ahead, behind) = if upstream.is_some() {
            let out = run_git(cwd, &["rev-list", "--left-right", "--count", "HEAD...@{u}"]).await?;
            parse_ahead_behind(&out)
        } else {
            let out = run_git(cwd, &["rev-list", "--count", "HEAD", "--not", "--remotes"]).await?;
            (out.parse().unwrap_or(0), 0)
        };

        debug!(path = %cwd.display(), branch = %branch, ahead, behind, "computed push status");
        Ok(PushStatus {
            branch,
            upstream,
            ahead,
            behind,
        })
    }

    async fn unpushed_commits(&self, cwd: &Path) -> Result<Vec<CommitInfo>> {
        if self.head(cwd).await?.is_none() {
            return Ok(Vec::new());
        }
        let has_upstream = run_git(cwd, &["rev-parse", "--abbrev-ref", "@{u}"]).await.is_ok();
        let out = if has_upstream {
            run_git(cwd, &["log", LOG_FORMAT, "@{u}..HEAD"]).await?
        } else {
            run_git(cwd, &["log", LOG_FORMAT, "HEAD", "--not", "--remotes"]).await?
        };
        Ok(parse_log(&out))
    }

    async fn remotes(&self, cwd: &Path) -> Result<Vec<String>> {
        let out = run_git(cwd, &["remote"]).await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn head(&self, cwd: &Path) -> Result<Option<String>> {
        match run_git(cwd, &["rev-parse", "--verify", "-q", "HEAD"]).await {
            Ok(hash) if !hash.is_empty() => Ok(Some(hash)),
            Ok(_) | Err(GitPilotError::Command { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn commit(&self, permit: &Permit, cwd: &Path, message: &str) -> Result<String> {
        permit.check()?;
        run_git(cwd, &["commit", "-m", message]).await?;
        let sha = run_git(cwd, &["rev-parse", "HEAD"]).await?;
        debug!(path = %cwd.display(), sha = %sha, "created commit");
        Ok(sha)
    }

    async fn push(&self, permit: &Permit, cwd: &Path, args: &PushArgs) -> Result<CommandOutput> {
        permit.check()?;
        let out = run_git_output(cwd, &args.to_args()).await?;
        debug!(
            path = %cwd.display(),
            remote = %args.remote,
            branch = %args.branch,
            "pushed"
        );
        Ok(out)
    }
}

async fn upstream_of(cwd: &Path, branch: &str) -> Option<Upstream> {
    let remote_key = format!("branch.{branch}.remote");
    let merge_key = format!("branch.{branch}.merge");
    let remote = run_git(cwd, &["config", "--get", &remote_key]).await.ok()?;
    let merge = run_git(cwd, &["config", "--get", &merge_key]).await.ok()?;
    let upstream_branch = merge.strip_prefix("refs/heads/").unwrap_or(&merge);
    if remote.is_empty() || upstream_branch.is_empty() {
        return None;
    }
    Some(Upstream {
        remote,
        branch: upstream_branch.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Process plumbing
// ---------------------------------------------------------------------------

/// Runs a git command and returns trimmed stdout on success.
async fn run_git(cwd: &Path, args: &[&str]) -> Result<String> {
    Ok(run_git_output(cwd, args).await?.stdout.trim().to_string())
}

async fn run_git_output(cwd: &Path, args: &[&str]) -> Result<CommandOutput> {
    let mut cmd = Command::new("git");
    cmd.arg("-C").arg(cwd).args(args).kill_on_drop(true);

    trace!(
        cmd = %format!("git -C {} {}", cwd.display(), args.join(" ")),
        "running git command"
    );

    let output = cmd.output().await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            warn!("git not found in PATH");
        }
        GitPilotError::Spawn {
            program: "git".into(),
            reason: e.to_string(),
        }
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if output.status.success() {
        Ok(CommandOutput { stdout, stderr })
    } else {
        Err(GitPilotError::Command {
            command: format!("git {}", args.join(" ")),
            stderr,
        })
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Join `--numstat` and `--name-status` output by path.
fn merge_staged(numstat: &str, name_status: &str) -> Vec<StagedFile> {
    let mut files: Vec<StagedFile> = name_status
        .lines()
        .filter_map(|line| {
            let (code, path) = line.split_once('\t')?;
            Some(StagedFile {
                path: path.to_string(),
                status: FileStatus::from_code(code),
                additions: 0,
                deletions: 0,
            })
        })
        .collect();

    for line in numstat.lines() {
        let mut parts = line.splitn(3, '\t');
        let (Some(add), Some(del), Some(path)) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        if let Some(file) = files.iter_mut().find(|f| f.path == path) {
            // Binary files report "-".
            file.additions = add.parse().unwrap_or(0);
            file.deletions = del.parse().unwrap_or(0);
        }
    }
    files
}

fn parse_log(output: &str) -> Vec<CommitInfo> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split('\x1f');
            Some(CommitInfo {
                hash: parts.next()?.to_string(),
                short_hash: parts.next()?.to_string(),
                subject: parts.next()?.to_string(),
                author: parts.next()?.to_string(),
                date: parts.next()?.to_string(),
            })
        })
        .collect()
}

fn parse_ahead_behind(output: &str) -> (u32, u32) {
    let mut parts = output.split_whitespace();
    let ahead = parts.next().and_then(|n| n.parse().ok()).unwrap_or(0);
    let behind = parts.next().and_then(|n| n.parse().ok()).unwrap_or(0);
    (ahead, behind)
}
