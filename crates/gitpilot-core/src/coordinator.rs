//! The single owner of queue, lock table and observer set.
//!
//! [`Coordinator`] is constructed once and shared by reference (it is a cheap
//! clone). All admission decisions go through one mutex around the
//! [`AdmissionQueue`]; state envelopes are published while that mutex is held
//! so observers see transitions in the order they were applied. Nothing here
//! awaits while holding a lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::agent::{AgentRunner, ClaudeRunner, EventSink};
use crate::broadcast::{Envelope, Observer, ProgressBroadcaster};
use crate::config::Config;
use crate::context::{self, CommitContext, PushContext};
use crate::error::{GitPilotError, Result};
use crate::git::{CommandGit, GitClient};
use crate::lock::{GitSerializer, LockAnomaly};
use crate::pipeline::{Job, Pipeline};
use crate::queue::{AdmissionQueue, Admitted, CancelOutcome};
use crate::types::{
    OperationOptions, OperationRequest, OperationResult, ProgressEvent, ProgressKind,
    QueueStatus, Session, SessionId, SessionState,
};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub max_concurrent: usize,
    pub history_limit: usize,
    pub hold_timeout: Duration,
}

impl From<&Config> for CoordinatorSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrent: config.queue.max_concurrent,
            history_limit: config.queue.history_limit,
            hold_timeout: config.locks.hold_timeout(),
        }
    }
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    queue: Mutex<AdmissionQueue>,
    broadcaster: ProgressBroadcaster,
    pipeline: Pipeline,
    repositories: HashMap<String, PathBuf>,
    settled: Notify,
    closed: AtomicBool,
}

impl Coordinator {
    pub fn new(
        settings: CoordinatorSettings,
        repositories: HashMap<String, PathBuf>,
        git: Arc<dyn GitClient>,
        agent: Arc<dyn AgentRunner>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(AdmissionQueue::new(
                    settings.max_concurrent,
                    settings.history_limit,
                )),
                broadcaster: ProgressBroadcaster::new(),
                pipeline: Pipeline {
                    git,
                    agent,
                    locks: GitSerializer::new(settings.hold_timeout),
                },
                repositories,
                settled: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Production wiring: the `git` CLI and the configured agent executable.
    pub fn from_config(config: &Config, root: &Path) -> Result<Self> {
        config.ensure_valid()?;
        Ok(Self::new(
            CoordinatorSettings::from(config),
            config.repository_map(root),
            Arc::new(CommandGit::new()),
            Arc::new(ClaudeRunner::new(config.agent.clone())),
        ))
    }

    fn lock_queue(&self) -> MutexGuard<'_, AdmissionQueue> {
        self.inner.lock_queue()
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Validate and enqueue `request`, admitting it at once if capacity
    /// allows. Rejected requests leave no session behind.
    pub fn submit(&self, request: OperationRequest) -> Result<SessionId> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(GitPilotError::Cancelled);
        }
        request.validate()?;
        self.repository_path(&request.repository_context_id)?;

        let session = Session::new(request);
        let (id, admitted) = {
            let mut queue = self.lock_queue();
            let id = queue.enqueue(session);
            self.inner.publish_state(&queue, &id);
            let admitted = queue.admit();
            for a in &admitted {
                self.inner.publish_state(&queue, &a.id);
            }
            (id, admitted)
        };

        info!(session_id = %id, "session submitted");
        for a in admitted {
            self.launch(a);
        }
        Ok(id)
    }

    /// Cancel a queued or running session. Returns whether the request was
    /// accepted; terminal and unknown sessions are not.
    pub fn cancel(&self, id: &str) -> bool {
        let outcome = {
            let mut queue = self.lock_queue();
            let outcome = queue.cancel(id);
            if outcome == CancelOutcome::Dequeued {
                self.inner.publish_state(&queue, id);
                queue.evict();
            }
            outcome
        };
        match outcome {
            CancelOutcome::Dequeued => {
                info!(session_id = %id, "queued session cancelled");
                self.inner.settled.notify_waiters();
            }
            CancelOutcome::Signalled => info!(session_id = %id, "cancellation signalled"),
            _ => {}
        }
        outcome.accepted()
    }

    pub fn status(&self) -> QueueStatus {
        self.lock_queue().status()
    }

    pub fn session(&self, id: &str) -> Result<Session> {
        self.lock_queue()
            .session(id)
            .cloned()
            .ok_or_else(|| GitPilotError::SessionNotFound(id.to_string()))
    }

    /// Suspend until session `id` is terminal.
    pub async fn wait(&self, id: &str) -> Result<SessionState> {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let state = self.lock_queue().session(id).map(|s| s.state);
            match state {
                None => return Err(GitPilotError::SessionNotFound(id.to_string())),
                Some(state) if state.is_terminal() => return Ok(state),
                Some(_) => {}
            }
            notified.await;
        }
    }

    /// Stop accepting work, cancel everything, and wait up to `timeout` for
    /// running sessions to wind down. Observer streams end afterwards.
    pub async fn shutdown(&self, timeout: Duration) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let outcomes = {
            let mut queue = self.lock_queue();
            let outcomes = queue.cancel_all();
            for (id, outcome) in &outcomes {
                if *outcome == CancelOutcome::Dequeued {
                    self.inner.publish_state(&queue, id);
                }
            }
            outcomes
        };
        self.inner.settled.notify_waiters();
        info!(sessions = outcomes.len(), "cancelling sessions for shutdown");

        let drained = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.inner.settled.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let idle = self.lock_queue().running_count() == 0;
                if idle {
                    break;
                }
                notified.await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("shutdown timed out with sessions still running");
        }
        self.inner.broadcaster.close();
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    fn launch(&self, admitted: Admitted) {
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.drive(admitted).await });
    }

    async fn drive(self, admitted: Admitted) {
        let Admitted {
            id,
            request,
            cancel,
        } = admitted;
        let kind = request.kind;
        let repo = request.repository_context_id.clone();
        info!(session_id = %id, repo = %repo, kind = %kind, "session started");

        let cwd = match self.repository_path(&repo) {
            Ok(path) => path,
            Err(e) => {
                self.complete(&id, SessionState::Failed, OperationResult::failed("Failed", e.to_string()));
                return;
            }
        };
        let job = Job {
            session_id: id.clone(),
            request,
            cwd,
            cancel,
            events: self.sink_for(&id),
        };

        // Run on its own task so a panic in the pipeline still resolves the session.
        let pipeline = self.inner.pipeline.clone();
        let handle = tokio::spawn(async move { pipeline.execute(&job).await });

        let (state, result) = match handle.await {
            Ok(Ok(result)) => {
                info!(session_id = %id, summary = %result.summary, "session succeeded");
                (SessionState::Succeeded, result)
            }
            Ok(Err(e)) if e.is_cancelled() => {
                info!(session_id = %id, "session cancelled");
                (SessionState::Cancelled, OperationResult::failed("Cancelled", e.to_string()))
            }
            Ok(Err(e)) => {
                if matches!(e, GitPilotError::Spawn { .. }) {
                    error!(session_id = %id, repo = %repo, error = %e, "session failed to start a process");
                } else {
                    warn!(session_id = %id, repo = %repo, error = %e, "session failed");
                }
                (
                    SessionState::Failed,
                    OperationResult::failed(format!("{kind} failed"), e.to_string()),
                )
            }
            Err(join) => {
                error!(session_id = %id, error = %join, "session task crashed");
                (
                    SessionState::Failed,
                    OperationResult::failed(format!("{kind} failed"), join.to_string()),
                )
            }
        };
        self.complete(&id, state, result);
    }

    /// Record a terminal state and admit whatever the freed slot allows.
    fn complete(&self, id: &str, state: SessionState, result: OperationResult) {
        let admitted = {
            let mut queue = self.lock_queue();
            if queue.finish(id, state, result) {
                self.inner.publish_state(&queue, id);
            }
            let admitted = queue.admit();
            for a in &admitted {
                self.inner.publish_state(&queue, &a.id);
            }
            queue.evict();
            admitted
        };
        self.inner.settled.notify_waiters();
        for a in admitted {
            self.launch(a);
        }
    }

    fn sink_for(&self, id: &str) -> EventSink {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let id = id.to_string();
        Arc::new(move |kind: ProgressKind, payload: serde_json::Value| {
            if let Some(inner) = weak.upgrade() {
                inner.record_event(ProgressEvent {
                    session_id: id.clone(),
                    timestamp: Utc::now(),
                    kind,
                    payload,
                });
            }
        })
    }

    // -----------------------------------------------------------------------
    // Read side
    // -----------------------------------------------------------------------

    pub fn repository_path(&self, id: &str) -> Result<PathBuf> {
        self.inner
            .repositories
            .get(id)
            .cloned()
            .ok_or_else(|| GitPilotError::UnknownRepository(id.to_string()))
    }

    pub fn repository_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.repositories.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn commit_context(&self, repository: &str) -> Result<CommitContext> {
        let cwd = self.repository_path(repository)?;
        context::build_commit_context(self.inner.pipeline.git.as_ref(), &cwd).await
    }

    pub async fn push_context(
        &self,
        repository: &str,
        options: &OperationOptions,
    ) -> Result<PushContext> {
        options.validate()?;
        let cwd = self.repository_path(repository)?;
        context::build_push_context(self.inner.pipeline.git.as_ref(), &cwd, options).await
    }

    pub fn subscribe(&self) -> Observer {
        self.inner.broadcaster.connect()
    }

    pub fn broadcaster(&self) -> &ProgressBroadcaster {
        &self.inner.broadcaster
    }

    pub fn lock_anomalies(&self) -> Vec<LockAnomaly> {
        self.inner.pipeline.locks.anomalies()
    }

    pub fn max_concurrent(&self) -> usize {
        self.lock_queue().max_concurrent()
    }
}

impl Inner {
    fn lock_queue(&self) -> MutexGuard<'_, AdmissionQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_state(&self, queue: &AdmissionQueue, id: &str) {
        if let Some(session) = queue.session(id) {
            self.broadcaster
                .publish(&Envelope::session_state(&session.summary()));
        }
    }

    fn record_event(&self, event: ProgressEvent) {
        let mut queue = self.lock_queue();
        let envelope = Envelope::session_progress(&event);
        if queue.record_event(event) {
            self.broadcaster.publish(&envelope);
        }
    }
}
