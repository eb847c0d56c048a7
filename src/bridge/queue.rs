use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bevy::prelude::World;

use super::lock;

/// Deferred work for the authorized context. Runs exactly once, with the world.
pub type QueuedCallable = Box<dyn FnOnce(&mut World) + Send + 'static>;

/// FIFO shared between request workers (producers) and the dispatcher (sole consumer).
#[derive(Clone, Default)]
pub struct WorkQueue {
    items: Arc<Mutex<VecDeque<QueuedCallable>>>,
}

impl WorkQueue {
    pub fn push(&self, job: QueuedCallable) {
        lock(&self.items).push_back(job);
    }

    /// Takes everything queued so far. Jobs pushed while the batch runs wait
    /// for the next drain.
    pub fn drain(&self) -> VecDeque<QueuedCallable> {
        std::mem::take(&mut *lock(&self.items))
    }

    /// Drops all queued jobs without running them.
    pub fn clear(&self) -> usize {
        self.drain().len()
    }

    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.items).is_empty()
    }
}
