//! Admission state machine.
//!
//! [`AdmissionQueue`] owns the running set, the wait list and the session
//! table. It performs no I/O and never awaits; the coordinator keeps it
//! behind a single mutex, which makes every check-then-admit atomic.

use std::collections::{HashMap, VecDeque};

use tokio_util::sync::CancellationToken;

use crate::types::{
    OperationRequest, OperationResult, ProgressEvent, QueueStatus, Session, SessionId,
    SessionState, StateCounts,
};

/// A session that just moved to `running` and must now be executed.
#[derive(Debug, Clone)]
pub struct Admitted {
    pub id: SessionId,
    pub request: OperationRequest,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Removed from the wait list; it will never run.
    Dequeued,
    /// Running; the cancellation signal was sent.
    Signalled,
    AlreadyTerminal,
    NotFound,
}

impl CancelOutcome {
    pub fn accepted(&self) -> bool {
        matches!(self, CancelOutcome::Dequeued | CancelOutcome::Signalled)
    }
}

#[derive(Debug)]
struct WaitEntry {
    id: SessionId,
    priority: bool,
}

#[derive(Debug)]
pub struct AdmissionQueue {
    max_concurrent: usize,
    history_limit: usize,
    sessions: HashMap<SessionId, Session>,
    /// Submission order, for listing and eviction.
    order: VecDeque<SessionId>,
    waiting: VecDeque<WaitEntry>,
    running: HashMap<SessionId, CancellationToken>,
}

impl AdmissionQueue {
    pub fn new(max_concurrent: usize, history_limit: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            history_limit,
            sessions: HashMap::new(),
            order: VecDeque::new(),
            waiting: VecDeque::new(),
            running: HashMap::new(),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Add a `queued` session to the wait list. Priority entries go ahead
    /// of every ordinary entry but stay FIFO among themselves.
    pub fn enqueue(&mut self, session: Session) -> SessionId {
        let id = session.id.clone();
        let priority = session.request.execute_now;
        let entry = WaitEntry {
            id: id.clone(),
            priority,
        };
        if priority {
            let pos = self.waiting.iter().take_while(|e| e.priority).count();
            self.waiting.insert(pos, entry);
        } else {
            self.waiting.push_back(entry);
        }
        self.order.push_back(id.clone());
        self.sessions.insert(id.clone(), session);
        id
    }

    /// Move waiting sessions to `running` while capacity allows.
    pub fn admit(&mut self) -> Vec<Admitted> {
        let mut admitted = Vec::new();
        while self.running.len() < self.max_concurrent {
            let Some(entry) = self.waiting.pop_front() else {
                break;
            };
            let Some(session) = self.sessions.get_mut(&entry.id) else {
                continue;
            };
            if !session.transition(SessionState::Running) {
                continue;
            }
            let cancel = CancellationToken::new();
            self.running.insert(entry.id.clone(), cancel.clone());
            admitted.push(Admitted {
                id: entry.id,
                request: session.request.clone(),
                cancel,
            });
        }
        debug_assert!(self.running.len() <= self.max_concurrent);
        admitted
    }

    pub fn cancel(&mut self, id: &str) -> CancelOutcome {
        let Some(session) = self.sessions.get_mut(id) else {
            return CancelOutcome::NotFound;
        };
        match session.state {
            SessionState::Queued => {
                self.waiting.retain(|e| e.id != id);
                session.transition(SessionState::Cancelled);
                session.result = Some(OperationResult::failed(
                    "Cancelled before start",
                    "operation cancelled",
                ));
                CancelOutcome::Dequeued
            }
            SessionState::Running => match self.running.get(id) {
                Some(token) => {
                    token.cancel();
                    CancelOutcome::Signalled
                }
                None => CancelOutcome::NotFound,
            },
            _ => CancelOutcome::AlreadyTerminal,
        }
    }

    /// Record the terminal state of a running session. Returns false if the
    /// session is not running, leaving it untouched.
    pub fn finish(&mut self, id: &str, state: SessionState, result: OperationResult) -> bool {
        if !self.running.contains_key(id) {
            return false;
        }
        let Some(session) = self.sessions.get_mut(id) else {
            return false;
        };
        if !session.transition(state) {
            return false;
        }
        session.result = Some(result);
        self.running.remove(id);
        true
    }

    /// Append a progress event to its session's log.
    pub fn record_event(&mut self, event: ProgressEvent) -> bool {
        match self.sessions.get_mut(&event.session_id) {
            Some(session) if !session.state.is_terminal() => {
                session.events.push(event);
                true
            }
            _ => false,
        }
    }

    /// Drop every waiting session and signal every running one.
    pub fn cancel_all(&mut self) -> Vec<(SessionId, CancelOutcome)> {
        let ids: Vec<SessionId> = self
            .waiting
            .iter()
            .map(|e| e.id.clone())
            .chain(self.running.keys().cloned())
            .collect();
        ids.into_iter()
            .map(|id| {
                let outcome = self.cancel(&id);
                (id, outcome)
            })
            .collect()
    }

    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for session in self.sessions.values() {
            counts.record(session.state);
        }
        counts
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            counts: self.counts(),
            sessions: self
                .order
                .iter()
                .filter_map(|id| self.sessions.get(id))
                .map(Session::summary)
                .collect(),
        }
    }

    /// Forget the oldest terminal sessions beyond the history limit.
    /// Queued and running sessions are never evicted.
    pub fn evict(&mut self) {
        let mut terminal = self
            .sessions
            .values()
            .filter(|s| s.state.is_terminal())
            .count();
        let limit = self.history_limit;
        if terminal <= limit {
            return;
        }
        let sessions = &mut self.sessions;
        self.order.retain(|id| {
            if terminal <= limit {
                return true;
            }
            let is_terminal = sessions.get(id).is_some_and(|s| s.state.is_terminal());
            if is_terminal {
                sessions.remove(id);
                terminal -= 1;
            }
            !is_terminal
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OperationKind;

    fn session(priority: bool) -> Session {
        let mut req = OperationRequest::new(OperationKind::Push, "default");
        req.execute_now = priority;
        Session::new(req)
    }

    fn ok() -> OperationResult {
        OperationResult::succeeded("done", serde_json::Value::Null)
    }

    #[test]
    fn three_submissions_with_ceiling_two() {
        let mut q = AdmissionQueue::new(2, 50);
        let a = q.enqueue(session(false));
        let b = q.enqueue(session(false));
        let c = q.enqueue(session(false));
        let admitted: Vec<_> = q.admit().into_iter().map(|x| x.id).collect();
        assert_eq!(admitted, vec![a.clone(), b]);
        assert_eq!((q.running_count(), q.queued_count()), (2, 1));

        assert!(q.finish(&a, SessionState::Succeeded, ok()));
        let next: Vec<_> = q.admit().into_iter().map(|x| x.id).collect();
        assert_eq!(next, vec![c]);
        assert_eq!((q.running_count(), q.queued_count()), (2, 0));
    }

    #[test]
    fn priority_jumps_the_wait_list_but_not_the_ceiling() {
        let mut q = AdmissionQueue::new(1, 50);
        let first = q.enqueue(session(false));
        q.admit();
        let normal = q.enqueue(session(false));
        let urgent = q.enqueue(session(true));
        let urgent2 = q.enqueue(session(true));
        assert!(q.admit().is_empty());
        assert_eq!(q.running_count(), 1);

        q.finish(&first, SessionState::Succeeded, ok());
        assert_eq!(q.admit()[0].id, urgent);
        q.finish(&urgent, SessionState::Succeeded, ok());
        assert_eq!(q.admit()[0].id, urgent2);
        q.finish(&urgent2, SessionState::Succeeded, ok());
        assert_eq!(q.admit()[0].id, normal);
    }

    #[test]
    fn cancelled_queued_session_never_runs() {
        let mut q = AdmissionQueue::new(1, 50);
        let running = q.enqueue(session(false));
        q.admit();
        let waiting = q.enqueue(session(false));

        assert_eq!(q.cancel(&waiting), CancelOutcome::Dequeued);
        assert_eq!(q.session(&waiting).unwrap().state, SessionState::Cancelled);
        assert!(q.session(&waiting).unwrap().started_at.is_none());

        q.finish(&running, SessionState::Succeeded, ok());
        assert!(q.admit().is_empty());
        assert_eq!(q.session(&waiting).unwrap().state, SessionState::Cancelled);
    }

    #[test]
    fn cancelling_running_session_signals_its_token() {
        let mut q = AdmissionQueue::new(1, 50);
        let id = q.enqueue(session(false));
        let admitted = q.admit().remove(0);
        assert_eq!(q.cancel(&id), CancelOutcome::Signalled);
        assert!(admitted.cancel.is_cancelled());
        // State changes only once the pipeline reports back.
        assert_eq!(q.session(&id).unwrap().state, SessionState::Running);
    }

    #[test]
    fn terminal_states_are_absorbing() {
        let mut q = AdmissionQueue::new(1, 50);
        let id = q.enqueue(session(false));
        q.admit();
        assert!(q.finish(&id, SessionState::Failed, OperationResult::failed("x", "y")));
        assert!(!q.finish(&id, SessionState::Succeeded, ok()));
        assert_eq!(q.cancel(&id), CancelOutcome::AlreadyTerminal);
        assert_eq!(q.session(&id).unwrap().state, SessionState::Failed);
    }

    #[test]
    fn rejected_finish_keeps_session_running() {
        let mut q = AdmissionQueue::new(1, 50);
        let id = q.enqueue(session(false));
        q.admit();
        assert!(!q.finish(&id, SessionState::Queued, ok()));
        let s = q.session(&id).unwrap();
        assert_eq!(s.state, SessionState::Running);
        assert!(s.result.is_none());
        // The slot is still held, so nothing else is admitted.
        q.enqueue(session(false));
        assert!(q.admit().is_empty());
        assert!(q.finish(&id, SessionState::Succeeded, ok()));
        assert_eq!(q.session(&id).unwrap().state, SessionState::Succeeded);
    }

    #[test]
    fn unknown_session_cancel_is_not_found() {
        let mut q = AdmissionQueue::new(1, 50);
        assert_eq!(q.cancel("missing"), CancelOutcome::NotFound);
        assert!(!CancelOutcome::NotFound.accepted());
    }

    #[test]
    fn history_evicts_oldest_terminal_only() {
        let mut q = AdmissionQueue::new(1, 2);
        let mut finished = Vec::new();
        for _ in 0..4 {
            let id = q.enqueue(session(false));
            q.admit();
            q.finish(&id, SessionState::Succeeded, ok());
            q.evict();
            finished.push(id);
        }
        let live = q.enqueue(session(false));
        q.admit();
        let queued = q.enqueue(session(false));
        q.evict();

        assert!(q.session(&finished[0]).is_none());
        assert!(q.session(&finished[1]).is_none());
        assert!(q.session(&finished[3]).is_some());
        assert!(q.session(&live).is_some());
        assert!(q.session(&queued).is_some());
        assert_eq!(q.status().sessions.len(), 4);
    }

    #[test]
    fn events_are_logged_in_order_until_terminal() {
        let mut q = AdmissionQueue::new(1, 50);
        let id = q.enqueue(session(false));
        q.admit();
        for i in 0..3 {
            assert!(q.record_event(ProgressEvent {
                session_id: id.clone(),
                timestamp: chrono::Utc::now(),
                kind: crate::types::ProgressKind::Message,
                payload: serde_json::json!(i),
            }));
        }
        q.finish(&id, SessionState::Succeeded, ok());
        let payloads: Vec<_> = q.session(&id).unwrap().events.iter().map(|e| e.payload.clone()).collect();
        assert_eq!(payloads, vec![serde_json::json!(0), serde_json::json!(1), serde_json::json!(2)]);
    }

    #[test]
    fn ceiling_holds_under_arbitrary_interleavings() {
        // Deterministic pseudo-random walk over submit / finish / cancel.
        for k in 1..=4 {
            let mut q = AdmissionQueue::new(k, 1000);
            let mut seed: u64 = 0x9e37_79b9 ^ k as u64;
            let mut running: Vec<SessionId> = Vec::new();
            let mut all: Vec<SessionId> = Vec::new();
            for _ in 0..500 {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                match (seed >> 33) % 4 {
                    0 | 1 => {
                        let id = q.enqueue(session((seed >> 20) % 5 == 0));
                        all.push(id);
                    }
                    2 if !running.is_empty() => {
                        let id = running.remove((seed as usize >> 8) % running.len());
                        q.finish(&id, SessionState::Succeeded, ok());
                    }
                    _ if !all.is_empty() => {
                        let id = all[(seed as usize >> 12) % all.len()].clone();
                        q.cancel(&id);
                        if q.session(&id).is_some_and(|s| s.state == SessionState::Running) {
                            running.retain(|r| r != &id);
                            q.finish(&id, SessionState::Cancelled, ok());
                        }
                    }
                    _ => {}
                }
                running.extend(q.admit().into_iter().map(|a| a.id));
                assert!(q.running_count() <= k);
                assert_eq!(q.counts().running, q.running_count());
            }
        }
    }
}
