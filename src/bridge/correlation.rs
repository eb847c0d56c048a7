use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use super::lock;
use crate::error::BridgeError;

/// What the authorized context hands back for one request.
pub type Payload = Result<Value, BridgeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{:08x}", self.0)
    }
}

struct PendingRequest {
    waiter: oneshot::Sender<Payload>,
    created_at: Instant,
}

/// Request id -> waiting caller. An entry exists from registration until its
/// result is delivered or the caller gives up, never longer.
#[derive(Clone, Default)]
pub struct CorrelationTable {
    pending: Arc<Mutex<HashMap<RequestId, PendingRequest>>>,
    next_id: Arc<AtomicU64>,
}

impl CorrelationTable {
    pub fn register(&self) -> (RequestId, oneshot::Receiver<Payload>) {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (waiter, rx) = oneshot::channel();
        lock(&self.pending).insert(
            id,
            PendingRequest {
                waiter,
                created_at: Instant::now(),
            },
        );
        (id, rx)
    }

    /// Delivers the result for `id`. Returns false when nobody is waiting any
    /// more, in which case the payload is discarded.
    pub fn resolve(&self, id: RequestId, payload: Payload) -> bool {
        let Some(pending) = lock(&self.pending).remove(&id) else {
            return false;
        };
        pending.waiter.send(payload).is_ok()
    }

    /// Drops the bookkeeping for `id` after its caller stopped waiting.
    pub fn forget(&self, id: RequestId) -> bool {
        lock(&self.pending).remove(&id).is_some()
    }

    /// Resolves every pending request with a reset error.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        let count = drained.len();
        for (id, pending) in drained {
            let _ = pending.waiter.send(Err(BridgeError::Reset { id }));
        }
        count
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.pending).is_empty()
    }

    pub fn contains(&self, id: RequestId) -> bool {
        lock(&self.pending).contains_key(&id)
    }

    pub fn oldest_age(&self) -> Option<Duration> {
        lock(&self.pending)
            .values()
            .map(|p| p.created_at.elapsed())
            .max()
    }
}
