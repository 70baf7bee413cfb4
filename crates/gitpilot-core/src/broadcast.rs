//! Fan-out of session changes to connected observers.
//!
//! Every change is serialized once into an [`Envelope`] frame and offered to
//! each observer's bounded channel with `try_send`. A slow or vanished
//! observer loses frames; it never stalls the publisher or other observers.
//! Observers that reconnect re-synchronize from the queue status.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{ProgressEvent, SessionSummary};

pub const EVENT_SESSION_STATE: &str = "session.state";
pub const EVENT_SESSION_PROGRESS: &str = "session.progress";
pub const EVENT_PING: &str = "ping";
pub const EVENT_PONG: &str = "pong";

const OBSERVER_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    pub fn session_state(summary: &SessionSummary) -> Self {
        Self::new(
            EVENT_SESSION_STATE,
            serde_json::to_value(summary).unwrap_or_default(),
        )
    }

    pub fn session_progress(event: &ProgressEvent) -> Self {
        Self::new(
            EVENT_SESSION_PROGRESS,
            serde_json::to_value(event).unwrap_or_default(),
        )
    }
}

/// A serialized envelope ready for any transport.
#[derive(Debug)]
pub struct Frame {
    pub event: String,
    pub json: String,
}

// ---------------------------------------------------------------------------
// ProgressBroadcaster
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ProgressBroadcaster {
    inner: Arc<Inner>,
}

struct Inner {
    observers: Mutex<HashMap<u64, mpsc::Sender<Arc<Frame>>>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        Self::with_buffer(OBSERVER_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                observers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Register a new observer. It is removed when dropped.
    pub fn connect(&self) -> Observer {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        self.inner.lock().insert(id, tx);
        debug!(observer = id, "observer connected");
        Observer {
            id,
            rx,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn disconnect(&self, id: u64) {
        if self.inner.lock().remove(&id).is_some() {
            debug!(observer = id, "observer disconnected");
        }
    }

    pub fn observer_count(&self) -> usize {
        self.inner.lock().len()
    }

    /// Drop every observer's sender so their streams end after draining.
    pub fn close(&self) {
        let mut observers = self.inner.lock();
        debug!(observers = observers.len(), "closing all observers");
        observers.clear();
    }

    /// Deliver `envelope` to every observer. Returns how many accepted it.
    pub fn publish(&self, envelope: &Envelope) -> usize {
        let json = match serde_json::to_string(envelope) {
            Ok(json) => json,
            Err(e) => {
                warn!(event = %envelope.event, error = %e, "failed to serialize envelope");
                return 0;
            }
        };
        let frame = Arc::new(Frame {
            event: envelope.event.clone(),
            json,
        });

        let mut observers = self.inner.lock();
        let mut delivered = 0;
        observers.retain(|id, tx| match tx.try_send(Arc::clone(&frame)) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(observer = id, event = %frame.event, "observer lagging, frame dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(observer = id, "observer gone, removing");
                false
            }
        });
        delivered
    }

    /// Answer an inbound observer message. A ping yields a pong carrying the
    /// same payload; anything else yields nothing.
    pub fn handle_inbound(&self, text: &str) -> Option<Envelope> {
        let envelope: Envelope = serde_json::from_str(text).ok()?;
        (envelope.event == EVENT_PING).then(|| Envelope::new(EVENT_PONG, envelope.data))
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, mpsc::Sender<Arc<Frame>>>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// One connected observer's inbox.
pub struct Observer {
    id: u64,
    rx: mpsc::Receiver<Arc<Frame>>,
    registry: Weak<Inner>,
}

impl Observer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Arc<Frame>> {
        self.rx.recv().await
    }
}

impl Stream for Observer {
    type Item = Arc<Frame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.lock().remove(&self.id);
        }
    }
}
