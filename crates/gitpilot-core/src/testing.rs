//! In-memory collaborators for exercising the coordinator without git or an
//! agent binary. Enabled for this crate's tests and, through the `testing`
//! feature, for downstream test suites.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentOutcome, AgentRunner, EventSink};
use crate::error::{GitPilotError, Result};
use crate::git::{
    CommandOutput, CommitInfo, FileStatus, GitClient, PushArgs, PushStatus, StagedFile, Upstream,
};
use crate::lock::Permit;
use crate::types::ProgressKind;

// ---------------------------------------------------------------------------
// FakeGit
// ---------------------------------------------------------------------------

#[derive(Default)]
struct GitState {
    branch: String,
    staged: Vec<StagedFile>,
    remotes: Vec<String>,
    upstream: Option<Upstream>,
    ahead: u32,
    behind: u32,
    commits: Vec<String>,
    pushes: Vec<PushArgs>,
    push_error: Option<String>,
    mutation_delay: Duration,
    active: HashMap<PathBuf, usize>,
    peak: HashMap<PathBuf, usize>,
    mutations: usize,
}

/// A scripted repository. Clones share state.
#[derive(Clone)]
pub struct FakeGit {
    state: Arc<Mutex<GitState>>,
}

impl Default for FakeGit {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeGit {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(GitState {
                branch: "main".into(),
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GitState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_staged(self, paths: &[&str]) -> Self {
        self.lock().staged = paths
            .iter()
            .map(|p| StagedFile {
                path: p.to_string(),
                status: FileStatus::Modified,
                additions: 1,
                deletions: 0,
            })
            .collect();
        self
    }

    pub fn with_remotes(self, remotes: &[&str]) -> Self {
        self.lock().remotes = remotes.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn with_upstream(self, remote: &str, branch: &str) -> Self {
        self.lock().upstream = Some(Upstream {
            remote: remote.into(),
            branch: branch.into(),
        });
        self
    }

    pub fn with_ahead(self, ahead: u32) -> Self {
        self.lock().ahead = ahead;
        self
    }

    /// Make every commit and push take this long.
    pub fn with_mutation_delay(self, delay: Duration) -> Self {
        self.lock().mutation_delay = delay;
        self
    }

    pub fn failing_push(self, stderr: &str) -> Self {
        self.lock().push_error = Some(stderr.into());
        self
    }

    pub fn commit_messages(&self) -> Vec<String> {
        self.lock().commits.clone()
    }

    pub fn pushes(&self) -> Vec<PushArgs> {
        self.lock().pushes.clone()
    }

    pub fn head_hash(&self) -> String {
        hash_for(self.lock().commits.len())
    }

    /// Most mutating commands ever in flight at once for `cwd`.
    pub fn peak_overlap(&self, cwd: &Path) -> usize {
        self.lock().peak.get(cwd).copied().unwrap_or(0)
    }

    pub fn mutation_count(&self) -> usize {
        self.lock().mutations
    }

    /// Commit as an agent would, by running `git commit` itself.
    pub async fn agent_commit(&self, cwd: &Path, message: &str) -> String {
        self.mutate(cwd, |s| {
            s.commits.push(message.to_string());
            s.staged.clear();
            s.ahead += 1;
        })
        .await;
        self.head_hash()
    }

    async fn mutate(&self, cwd: &Path, apply: impl FnOnce(&mut GitState)) {
        let delay = {
            let mut s = self.lock();
            let active = s.active.entry(cwd.to_path_buf()).or_default();
            *active += 1;
            let now = *active;
            let peak = s.peak.entry(cwd.to_path_buf()).or_default();
            *peak = (*peak).max(now);
            s.mutations += 1;
            s.mutation_delay
        };
        let _in_flight = InFlight {
            git: self,
            cwd: cwd.to_path_buf(),
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        apply(&mut self.lock());
    }
}

/// Leaves the active count for `cwd` when a mutation ends, including when
/// its future is dropped mid-command.
struct InFlight<'a> {
    git: &'a FakeGit,
    cwd: PathBuf,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(active) = self.git.lock().active.get_mut(&self.cwd) {
            *active -= 1;
        }
    }
}

fn hash_for(n: usize) -> String {
    if n == 0 {
        return String::new();
    }
    format!("{n:040x}")
}

#[async_trait]
impl GitClient for FakeGit {
    async fn staged_files(&self, _cwd: &Path) -> Result<Vec<StagedFile>> {
        Ok(self.lock().staged.clone())
    }

    async fn staged_diff(&self, _cwd: &Path) -> Result<String> {
        Ok(self
            .lock()
            .staged
            .iter()
            .map(|f| format!("diff --git a/{0} b/{0}\n+change\n", f.path))
            .collect())
    }

    async fn current_branch(&self, _cwd: &Path) -> Result<String> {
        Ok(self.lock().branch.clone())
    }

    async fn log(&self, _cwd: &Path, limit: usize, offset: usize) -> Result<Vec<CommitInfo>> {
        let s = self.lock();
        Ok(s.commits
            .iter()
            .enumerate()
            .rev()
            .skip(offset)
            .take(limit)
            .map(|(i, subject)| {
                let hash = hash_for(i + 1);
                CommitInfo {
                    short_hash: hash[..7].to_string(),
                    hash,
                    subject: subject.clone(),
                    author: "Fake".into(),
                    date: "2026-01-01T00:00:00+00:00".into(),
                }
            })
            .collect())
    }

    async fn push_status(&self, _cwd: &Path) -> Result<PushStatus> {
        let s = self.lock();
        Ok(PushStatus {
            branch: s.branch.clone(),
            upstream: s.upstream.clone(),
            ahead: s.ahead,
            behind: s.behind,
        })
    }

    async fn unpushed_commits(&self, cwd: &Path) -> Result<Vec<CommitInfo>> {
        let ahead = self.lock().ahead as usize;
        self.log(cwd, ahead, 0).await
    }

    async fn remotes(&self, _cwd: &Path) -> Result<Vec<String>> {
        Ok(self.lock().remotes.clone())
    }

    async fn head(&self, _cwd: &Path) -> Result<Option<String>> {
        let hash = self.head_hash();
        Ok((!hash.is_empty()).then_some(hash))
    }

    async fn commit(&self, permit: &Permit, cwd: &Path, message: &str) -> Result<String> {
        permit.check()?;
        Ok(self.agent_commit(cwd, message).await)
    }

    async fn push(&self, permit: &Permit, cwd: &Path, args: &PushArgs) -> Result<CommandOutput> {
        permit.check()?;
        let error = self.lock().push_error.clone();
        let recorded = args.clone();
        self.mutate(cwd, move |s| {
            s.pushes.push(recorded);
            if s.push_error.is_none() {
                s.ahead = 0;
                s.upstream = Some(Upstream {
                    remote: args.remote.clone(),
                    branch: args.branch.clone(),
                });
            }
        })
        .await;
        match error {
            Some(stderr) => Err(GitPilotError::Command {
                command: format!("git push {} {}", args.remote, args.branch),
                stderr,
            }),
            None => Ok(CommandOutput::default()),
        }
    }
}

// ---------------------------------------------------------------------------
// FakeAgent
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Behaviour {
    Reply(String),
    Commit(FakeGit),
    Hang,
    Fail(String),
}

/// A scripted agent. Clones share counters.
#[derive(Clone)]
pub struct FakeAgent {
    behaviour: Behaviour,
    delay: Duration,
    runs: Arc<AtomicUsize>,
    cancelled: Arc<AtomicUsize>,
}

impl FakeAgent {
    fn with(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            delay: Duration::ZERO,
            runs: Arc::new(AtomicUsize::new(0)),
            cancelled: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn succeeding() -> Self {
        Self::with(Behaviour::Reply("done".into()))
    }

    pub fn replying(text: &str) -> Self {
        Self::with(Behaviour::Reply(text.into()))
    }

    /// Commits through `git` the way the real agent shells out.
    pub fn committing(git: FakeGit) -> Self {
        Self::with(Behaviour::Commit(git))
    }

    /// Runs until cancelled.
    pub fn hanging() -> Self {
        Self::with(Behaviour::Hang)
    }

    pub fn failing(stderr: &str) -> Self {
        Self::with(Behaviour::Fail(stderr.into()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn cancelled_runs(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn pause(&self, cancel: &CancellationToken) -> Result<()> {
        let wait = async {
            match self.behaviour {
                Behaviour::Hang => std::future::pending::<()>().await,
                _ => tokio::time::sleep(self.delay).await,
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => {
                self.cancelled.fetch_add(1, Ordering::SeqCst);
                Err(GitPilotError::Cancelled)
            }
            _ = wait => Ok(()),
        }
    }
}

#[async_trait]
impl AgentRunner for FakeAgent {
    async fn run(
        &self,
        _prompt: &str,
        cwd: &Path,
        cancel: CancellationToken,
        events: EventSink,
    ) -> Result<AgentOutcome> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        events(ProgressKind::Message, json!({ "text": "Working." }));
        self.pause(&cancel).await?;

        let text = match &self.behaviour {
            Behaviour::Reply(text) => text.clone(),
            Behaviour::Commit(git) => {
                events(
                    ProgressKind::ToolStart,
                    json!({ "toolUseId": "tu_1", "name": "Bash", "input": { "command": "git commit" } }),
                );
                let hash = git.agent_commit(cwd, "chore: agent commit").await;
                events(
                    ProgressKind::ToolEnd,
                    json!({ "toolUseId": "tu_1", "isError": false, "output": hash }),
                );
                "chore: agent commit".to_string()
            }
            Behaviour::Hang => String::new(),
            Behaviour::Fail(stderr) => {
                events(ProgressKind::Error, json!({ "message": stderr }));
                return Err(GitPilotError::Command {
                    command: "claude".into(),
                    stderr: stderr.clone(),
                });
            }
        };
        Ok(AgentOutcome {
            text,
            cost_usd: 0.0,
            turns: 1,
        })
    }
}
