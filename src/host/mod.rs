//! Notifications the host application publishes about itself.

pub mod log_capture;
pub mod scripts;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use bevy::prelude::*;

use crate::buffers::{CompilationRecord, LogRecord};

/// Callbacks a subscriber receives from the host. All methods default to no-ops.
pub trait HostListener: Send + Sync {
    /// The authorized context is about to be torn down.
    fn before_reset(&self) {}
    /// The authorized context has been rebuilt and is ticking again.
    fn after_reset(&self) {}
    fn compilation_started(&self) {}
    fn compilation_finished(&self, _record: &CompilationRecord) {}
    fn log(&self, _record: &LogRecord) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listeners = Vec<(SubscriptionId, Arc<dyn HostListener>)>;

#[derive(Default)]
struct SignalsInner {
    next_id: AtomicU64,
    listeners: RwLock<Listeners>,
}

#[derive(Resource, Clone, Default)]
pub struct HostSignals {
    inner: Arc<SignalsInner>,
}

impl HostSignals {
    pub fn subscribe(&self, listener: Arc<dyn HostListener>) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.write().push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.read().len()
    }

    pub fn notify_before_reset(&self) {
        for listener in self.listeners() {
            listener.before_reset();
        }
    }

    pub fn notify_after_reset(&self) {
        for listener in self.listeners() {
            listener.after_reset();
        }
    }

    pub fn notify_compilation_started(&self) {
        for listener in self.listeners() {
            listener.compilation_started();
        }
    }

    pub fn notify_compilation_finished(&self, record: &CompilationRecord) {
        for listener in self.listeners() {
            listener.compilation_finished(record);
        }
    }

    pub fn notify_log(&self, record: &LogRecord) {
        for listener in self.listeners() {
            listener.log(record);
        }
    }

    // Callbacks run outside the lock so a listener may (un)subscribe or log.
    fn listeners(&self) -> Vec<Arc<dyn HostListener>> {
        self.read().iter().map(|(_, l)| l.clone()).collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Listeners> {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Listeners> {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
