//! Per-repository exclusive permits for mutating git commands.
//!
//! Each repository context has at most one [`Permit`] outstanding. Further
//! acquirers wait in FIFO order and are handed the permit directly when the
//! holder drops it, so release happens on every exit path of the holder,
//! including cancellation and panics.
//!
//! A watchdog force-releases permits held past the configured hold timeout.
//! The revoked holder observes this through [`Permit::revoked`] and a
//! [`LockAnomaly`] is recorded.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::{GitPilotError, Result};

const MAX_ANOMALIES: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockAnomaly {
    pub repository: String,
    pub session_id: String,
    pub held_for_secs: u64,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// GitSerializer
// ---------------------------------------------------------------------------

/// The lock table. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct GitSerializer {
    inner: Arc<Inner>,
}

struct Inner {
    table: Mutex<HashMap<String, RepoSlot>>,
    anomalies: Mutex<VecDeque<LockAnomaly>>,
    hold_timeout: Duration,
    next_generation: AtomicU64,
}

#[derive(Default)]
struct RepoSlot {
    holder: Option<Holder>,
    waiters: VecDeque<Waiter>,
}

struct Holder {
    session_id: String,
    generation: u64,
    acquired_at: Instant,
    revoke: watch::Sender<bool>,
    watchdog: Option<AbortHandle>,
}

struct Waiter {
    session_id: String,
    tx: oneshot::Sender<Permit>,
}

impl GitSerializer {
    pub fn new(hold_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(HashMap::new()),
                anomalies: Mutex::new(VecDeque::new()),
                hold_timeout,
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Wait until `repository` is free, then take it.
    ///
    /// Waiting never blocks other repositories. Dropping the returned future
    /// before it resolves removes the caller from the queue.
    pub async fn acquire(&self, repository: &str, session_id: &str) -> Result<Permit> {
        let rx = {
            let mut table = self.inner.lock_table();
            let slot = table.entry(repository.to_string()).or_default();
            if slot.holder.is_none() && slot.waiters.is_empty() {
                debug!(repo = %repository, session_id = %session_id, "permit granted");
                return Ok(self.inner.grant(slot, repository, session_id));
            }
            let (tx, rx) = oneshot::channel();
            slot.waiters.push_back(Waiter {
                session_id: session_id.to_string(),
                tx,
            });
            debug!(
                repo = %repository,
                session_id = %session_id,
                position = slot.waiters.len(),
                "waiting for permit"
            );
            rx
        };
        rx.await
            .map_err(|_| GitPilotError::LockClosed(repository.to_string()))
    }

    /// Session currently holding `repository`, if any.
    pub fn holder(&self, repository: &str) -> Option<String> {
        let table = self.inner.lock_table();
        table
            .get(repository)
            .and_then(|slot| slot.holder.as_ref())
            .map(|h| h.session_id.clone())
    }

    pub fn waiting(&self, repository: &str) -> usize {
        let table = self.inner.lock_table();
        table.get(repository).map_or(0, |slot| slot.waiters.len())
    }

    /// Force-released permits, oldest first.
    pub fn anomalies(&self) -> Vec<LockAnomaly> {
        self.inner
            .anomalies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

impl Inner {
    fn lock_table(&self) -> MutexGuard<'_, HashMap<String, RepoSlot>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install `session_id` as holder of an empty slot and mint its permit.
    fn grant(self: &Arc<Self>, slot: &mut RepoSlot, repository: &str, session_id: &str) -> Permit {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (revoke, revoked) = watch::channel(false);

        let watchdog = tokio::runtime::Handle::try_current().ok().map(|handle| {
            let weak: Weak<Inner> = Arc::downgrade(self);
            let repo = repository.to_string();
            let timeout = self.hold_timeout;
            handle
                .spawn(async move {
                    tokio::time::sleep(timeout).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.release(&repo, generation, true);
                    }
                })
                .abort_handle()
        });

        slot.holder = Some(Holder {
            session_id: session_id.to_string(),
            generation,
            acquired_at: Instant::now(),
            revoke,
            watchdog,
        });

        Permit {
            inner: Arc::clone(self),
            repository: repository.to_string(),
            session_id: session_id.to_string(),
            generation,
            revoked,
            armed: true,
        }
    }

    /// Release the permit of `generation` if it is still the holder, then
    /// hand the slot to the next live waiter.
    fn release(self: &Arc<Self>, repository: &str, generation: u64, forced: bool) {
        let mut table = self.lock_table();
        let Some(slot) = table.get_mut(repository) else {
            return;
        };
        match &slot.holder {
            Some(h) if h.generation == generation => {}
            _ => return,
        }
        if let Some(holder) = slot.holder.take() {
            if let Some(watchdog) = &holder.watchdog {
                watchdog.abort();
            }
            if forced {
                let held_for_secs = holder.acquired_at.elapsed().as_secs();
                warn!(
                    repo = %repository,
                    session_id = %holder.session_id,
                    held_for_secs,
                    "permit exceeded hold timeout, force-released"
                );
                holder.revoke.send_replace(true);
                self.record_anomaly(LockAnomaly {
                    repository: repository.to_string(),
                    session_id: holder.session_id,
                    held_for_secs,
                    at: Utc::now(),
                });
            }
        }

        while let Some(waiter) = slot.waiters.pop_front() {
            let permit = self.grant(slot, repository, &waiter.session_id);
            match waiter.tx.send(permit) {
                Ok(()) => {
                    debug!(repo = %repository, session_id = %waiter.session_id, "permit handed off");
                    break;
                }
                Err(mut orphan) => {
                    // The waiter gave up; undo the grant without re-entering the table.
                    orphan.armed = false;
                    if let Some(h) = slot.holder.take() {
                        if let Some(watchdog) = h.watchdog {
                            watchdog.abort();
                        }
                    }
                }
            }
        }

        if slot.holder.is_none() && slot.waiters.is_empty() {
            table.remove(repository);
        }
    }

    fn record_anomaly(&self, anomaly: LockAnomaly) {
        let mut anomalies = self.anomalies.lock().unwrap_or_else(PoisonError::into_inner);
        if anomalies.len() == MAX_ANOMALIES {
            anomalies.pop_front();
        }
        anomalies.push_back(anomaly);
    }
}

// ---------------------------------------------------------------------------
// Permit
// ---------------------------------------------------------------------------

/// Exclusive right to run mutating git commands in one repository.
///
/// Released when dropped.
pub struct Permit {
    inner: Arc<Inner>,
    repository: String,
    session_id: String,
    generation: u64,
    revoked: watch::Receiver<bool>,
    armed: bool,
}

impl Permit {
    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// True once the watchdog has force-released this permit.
    pub fn is_revoked(&self) -> bool {
        *self.revoked.borrow()
    }

    /// Resolves when the watchdog force-releases this permit; pends forever
    /// otherwise.
    pub fn revoked(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.revoked.clone();
        async move {
            let closed = rx.wait_for(|revoked| *revoked).await.is_err();
            if closed {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Fail fast if the permit is no longer valid.
    pub fn check(&self) -> Result<()> {
        if self.is_revoked() {
            return Err(GitPilotError::LockTimeout {
                repository: self.repository.clone(),
                held_secs: self.inner.hold_timeout.as_secs(),
            });
        }
        Ok(())
    }

    pub fn release(self) {}
}

impl Drop for Permit {
    fn drop(&mut self) {
        if self.armed {
            self.inner.release(&self.repository, self.generation, false);
        }
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("repository", &self.repository)
            .field("session_id", &self.session_id)
            .field("generation", &self.generation)
            .finish()
    }
}
