//! Execution of one admitted session.
//!
//! Every path takes the repository permit before touching the working tree
//! and holds it until the operation resolves. Dropping the permit on return
//! (or unwind) releases it.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::agent::{AgentOutcome, AgentRunner, EventSink};
use crate::context::{build_commit_context, build_push_context};
use crate::error::{GitPilotError, Result};
use crate::git::{GitClient, PushArgs};
use crate::lock::{GitSerializer, Permit};
use crate::prompt;
use crate::types::{OperationKind, OperationRequest, OperationResult, ProgressKind, SessionId};

/// The collaborators a session runs against.
#[derive(Clone)]
pub struct Pipeline {
    pub git: Arc<dyn GitClient>,
    pub agent: Arc<dyn AgentRunner>,
    pub locks: GitSerializer,
}

pub struct Job {
    pub session_id: SessionId,
    pub request: OperationRequest,
    pub cwd: PathBuf,
    pub cancel: CancellationToken,
    pub events: EventSink,
}

impl Job {
    fn emit(&self, kind: ProgressKind, payload: serde_json::Value) {
        (self.events)(kind, payload);
    }
}

impl Pipeline {
    pub async fn execute(&self, job: &Job) -> Result<OperationResult> {
        let permit = self.acquire(job).await?;
        debug!(session_id = %job.session_id, repo = %permit.repository(), "holding permit");

        match job.request.kind {
            OperationKind::Commit => match job.request.options.message.as_deref() {
                Some(message) => self.direct_commit(&permit, job, message.trim()).await,
                None => self.agent_commit(&permit, job).await,
            },
            OperationKind::Push => self.push(&permit, job).await,
            OperationKind::CreatePr => self.create_pr(&permit, job).await,
        }
    }

    /// Wait for the repository, giving up if the session is cancelled first.
    async fn acquire(&self, job: &Job) -> Result<Permit> {
        tokio::select! {
            biased;
            _ = job.cancel.cancelled() => Err(GitPilotError::Cancelled),
            permit = self.locks.acquire(&job.request.repository_context_id, &job.session_id) => permit,
        }
    }

    async fn direct_commit(&self, permit: &Permit, job: &Job, message: &str) -> Result<OperationResult> {
        if job.cancel.is_cancelled() {
            return Err(GitPilotError::Cancelled);
        }
        let hash = while_held(permit, job, self.git.commit(permit, &job.cwd, message)).await?;
        info!(session_id = %job.session_id, commit = %hash, "committed");
        Ok(OperationResult::succeeded(
            format!("Committed {}", short(&hash)),
            json!({ "commitHash": hash }),
        ))
    }

    async fn agent_commit(&self, permit: &Permit, job: &Job) -> Result<OperationResult> {
        let ctx = build_commit_context(self.git.as_ref(), &job.cwd).await?;
        if ctx.staged_files.is_empty() {
            return Err(GitPilotError::validation("Nothing staged to commit"));
        }
        let before = self.git.head(&job.cwd).await?;

        let text = prompt::commit_prompt(&ctx, job.request.custom_instructions.as_deref());
        let outcome = self.run_agent(permit, job, &text).await?;

        let after = self.git.head(&job.cwd).await?;
        let hash = match after {
            Some(hash) if after != before => hash,
            _ => {
                return Err(GitPilotError::Command {
                    command: "agent commit".into(),
                    stderr: format!("agent finished without creating a commit: {}", outcome.text),
                })
            }
        };
        info!(session_id = %job.session_id, commit = %hash, "agent committed");
        Ok(OperationResult::succeeded(
            format!("Committed {}", short(&hash)),
            json!({ "commitHash": hash, "message": outcome.text.trim() }),
        ))
    }

    async fn push(&self, permit: &Permit, job: &Job) -> Result<OperationResult> {
        let ctx = build_push_context(self.git.as_ref(), &job.cwd, &job.request.options).await?;
        if ctx.push_branch == "HEAD" {
            return Err(GitPilotError::validation("Cannot push a detached HEAD"));
        }
        if job.cancel.is_cancelled() {
            return Err(GitPilotError::Cancelled);
        }

        let args = PushArgs {
            remote: ctx.remote.clone(),
            branch: ctx.push_branch.clone(),
            force: job.request.options.force,
            set_upstream: job.request.options.set_upstream || !ctx.has_upstream,
        };
        let output = while_held(permit, job, self.git.push(permit, &job.cwd, &args)).await?;
        if !output.stderr.is_empty() {
            job.emit(ProgressKind::Message, json!({ "text": output.stderr }));
        }

        info!(
            session_id = %job.session_id,
            remote = %args.remote,
            branch = %args.branch,
            pushed = ctx.ahead_count,
            "pushed"
        );
        Ok(OperationResult::succeeded(
            format!(
                "Pushed {} commit(s) to {}/{}",
                ctx.ahead_count, args.remote, args.branch
            ),
            json!({
                "remote": args.remote,
                "branch": args.branch,
                "pushedCommits": ctx.ahead_count,
            }),
        ))
    }

    async fn create_pr(&self, permit: &Permit, job: &Job) -> Result<OperationResult> {
        let (push, commits) = tokio::try_join!(
            build_push_context(self.git.as_ref(), &job.cwd, &job.request.options),
            build_commit_context(self.git.as_ref(), &job.cwd),
        )?;
        let base = job
            .request
            .options
            .base_branch
            .clone()
            .unwrap_or_else(|| prompt::DEFAULT_BASE_BRANCH.to_string());

        let text = prompt::create_pr_prompt(
            &push,
            &commits,
            Some(&base),
            job.request.custom_instructions.as_deref(),
        );
        let outcome = self.run_agent(permit, job, &text).await?;
        let url = prompt::extract_pr_url(&outcome.text);

        Ok(OperationResult::succeeded(
            match &url {
                Some(url) => format!("Opened pull request {url}"),
                None => "Pull request created".to_string(),
            },
            json!({
                "prUrl": url,
                "base": base,
                "head": push.push_branch,
                "agentSummary": outcome.text.trim(),
            }),
        ))
    }

    /// Run the agent while holding `permit`. A force-released permit stops
    /// the agent and fails the session.
    async fn run_agent(&self, permit: &Permit, job: &Job, prompt_text: &str) -> Result<AgentOutcome> {
        let token = job.cancel.child_token();
        let run = self
            .agent
            .run(prompt_text, &job.cwd, token.clone(), Arc::clone(&job.events));
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => result,
            _ = permit.revoked() => {
                token.cancel();
                let _ = run.await;
                Err(revoked(permit, job))
            }
        }
    }
}

/// Run a git mutation while `permit` is valid. If the permit is force-released
/// first, the command future is dropped (killing the child) so it cannot
/// overlap the next holder.
async fn while_held<T>(
    permit: &Permit,
    job: &Job,
    command: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = permit.revoked() => Err(revoked(permit, job)),
        result = command => result,
    }
}

fn revoked(permit: &Permit, job: &Job) -> GitPilotError {
    let err = permit.check().err().unwrap_or(GitPilotError::LockTimeout {
        repository: permit.repository().to_string(),
        held_secs: 0,
    });
    job.emit(ProgressKind::Error, json!({ "message": err.to_string() }));
    err
}

fn short(hash: &str) -> &str {
    hash.get(..7).unwrap_or(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeAgent, FakeGit};
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    fn job(request: OperationRequest) -> (Job, Arc<Mutex<Vec<ProgressKind>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let job = Job {
            session_id: "s1".into(),
            request,
            cwd: PathBuf::from("/repo"),
            cancel: CancellationToken::new(),
            events: Arc::new(move |kind, _| sink_seen.lock().unwrap().push(kind)),
        };
        (job, seen)
    }

    fn pipeline(git: FakeGit, agent: FakeAgent, hold: Duration) -> Pipeline {
        Pipeline {
            git: Arc::new(git),
            agent: Arc::new(agent),
            locks: GitSerializer::new(hold),
        }
    }

    #[tokio::test]
    async fn direct_commit_returns_hash() {
        let git = FakeGit::new();
        let p = pipeline(git.clone(), FakeAgent::succeeding(), Duration::from_secs(60));
        let mut req = OperationRequest::new(OperationKind::Commit, "default");
        req.options.message = Some("  fix: trim  ".into());
        let (job, _) = job(req);

        let result = p.execute(&job).await.unwrap();
        assert!(result.success);
        assert_eq!(result.payload["commitHash"], git.head_hash());
        assert_eq!(git.commit_messages(), vec!["fix: trim"]);
        assert_eq!(p.locks.holder("default"), None);
    }

    #[tokio::test]
    async fn push_without_upstream_sets_it() {
        let git = FakeGit::new().with_remotes(&["upstream", "origin"]).with_ahead(2);
        let p = pipeline(git.clone(), FakeAgent::succeeding(), Duration::from_secs(60));
        let (job, _) = job(OperationRequest::new(OperationKind::Push, "default"));

        let result = p.execute(&job).await.unwrap();
        assert_eq!(result.payload["remote"], "origin");
        assert_eq!(result.payload["pushedCommits"], 2);
        let pushes = git.pushes();
        assert_eq!(pushes.len(), 1);
        assert!(pushes[0].set_upstream);
        assert!(!pushes[0].force);
    }

    #[tokio::test]
    async fn agent_commit_without_staged_files_fails() {
        let git = FakeGit::new();
        let p = pipeline(git, FakeAgent::succeeding(), Duration::from_secs(60));
        let (job, _) = job(OperationRequest::new(OperationKind::Commit, "default"));
        let err = p.execute(&job).await.unwrap_err();
        assert_eq!(err.to_string(), "Nothing staged to commit");
    }

    #[tokio::test]
    async fn agent_commit_reads_new_head() {
        let git = FakeGit::new().with_staged(&["src/lib.rs"]);
        let agent = FakeAgent::committing(git.clone());
        let p = pipeline(git.clone(), agent, Duration::from_secs(60));
        let (job, seen) = job(OperationRequest::new(OperationKind::Commit, "default"));

        let result = p.execute(&job).await.unwrap();
        assert_eq!(result.payload["commitHash"], git.head_hash());
        assert!(seen.lock().unwrap().contains(&ProgressKind::ToolStart));
    }

    #[tokio::test]
    async fn cancel_while_waiting_for_permit() {
        let git = FakeGit::new();
        let p = pipeline(git.clone(), FakeAgent::succeeding(), Duration::from_secs(60));
        let _held = p.locks.acquire("default", "other").await.unwrap();
        let (job, _) = job(OperationRequest::new(OperationKind::Push, "default"));
        job.cancel.cancel();
        let err = p.execute(&job).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(git.pushes().is_empty());
    }

    #[tokio::test]
    async fn revoked_permit_stops_agent_and_fails() {
        let git = FakeGit::new().with_staged(&["a.txt"]);
        let agent = FakeAgent::hanging();
        let p = pipeline(git, agent.clone(), Duration::from_millis(50));
        let (job, seen) = job(OperationRequest::new(OperationKind::Commit, "default"));

        let err = p.execute(&job).await.unwrap_err();
        assert!(matches!(err, GitPilotError::LockTimeout { .. }));
        assert_eq!(agent.cancelled_runs(), 1);
        assert!(seen.lock().unwrap().contains(&ProgressKind::Error));
        assert_eq!(p.locks.anomalies().len(), 1);
    }

    #[tokio::test]
    async fn push_outliving_hold_timeout_fails_without_overlap() {
        let git = FakeGit::new()
            .with_remotes(&["origin"])
            .with_mutation_delay(Duration::from_millis(300));
        let p = pipeline(git.clone(), FakeAgent::succeeding(), Duration::from_millis(50));
        let (first, seen) = job(OperationRequest::new(OperationKind::Push, "default"));
        let (mut second, _) = job(OperationRequest::new(OperationKind::Push, "default"));
        second.session_id = "s2".into();

        let p1 = p.clone();
        let a = tokio::spawn(async move { p1.execute(&first).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let p2 = p.clone();
        let b = tokio::spawn(async move { p2.execute(&second).await });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(matches!(a, Err(GitPilotError::LockTimeout { .. })));
        assert!(seen.lock().unwrap().contains(&ProgressKind::Error));
        // The second push also outlives the hold timeout, and neither overlapped.
        assert!(matches!(b, Err(GitPilotError::LockTimeout { .. })));
        assert_eq!(git.peak_overlap(Path::new("/repo")), 1);
        assert!(git.pushes().is_empty());
        assert_eq!(p.locks.holder("default"), None);
    }

    #[tokio::test]
    async fn direct_commit_outliving_hold_timeout_fails() {
        let git = FakeGit::new().with_mutation_delay(Duration::from_millis(300));
        let p = pipeline(git.clone(), FakeAgent::succeeding(), Duration::from_millis(50));
        let mut req = OperationRequest::new(OperationKind::Commit, "default");
        req.options.message = Some("slow".into());
        let (job, _) = job(req);

        let err = p.execute(&job).await.unwrap_err();
        assert!(matches!(err, GitPilotError::LockTimeout { .. }));
        assert!(git.commit_messages().is_empty());
        assert_eq!(p.locks.anomalies().len(), 1);
    }

    #[tokio::test]
    async fn create_pr_extracts_url() {
        let git = FakeGit::new().with_remotes(&["origin"]);
        let agent = FakeAgent::replying("Done: https://github.com/acme/web/pull/7");
        let p = pipeline(git, agent, Duration::from_secs(60));
        let mut req = OperationRequest::new(OperationKind::CreatePr, "default");
        req.options.base_branch = Some("develop".into());
        let (job, _) = job(req);

        let result = p.execute(&job).await.unwrap();
        assert_eq!(result.payload["prUrl"], "https://github.com/acme/web/pull/7");
        assert_eq!(result.payload["base"], "develop");
    }
}
