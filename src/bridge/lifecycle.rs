use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bevy::prelude::*;
use serde::Serialize;

use super::{lock, Bridge};
use crate::api::{bind_with_fallback, ListenerHandle};
use crate::error::{BridgeError, SuppressReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum LifecycleState {
    Uninitialized = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
    ResetPending = 5,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => Self::ResetPending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Signal the accept loop and return immediately.
    Detach,
    /// Signal the accept loop and wait up to the grace period for it to exit.
    Drain(Duration),
}

impl Bridge {
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn port(&self) -> Option<u16> {
        match self.port.load(Ordering::Acquire) {
            0 => None,
            port => Some(port),
        }
    }

    /// True only while the current accept loop is still serving.
    pub fn is_listening(&self) -> bool {
        lock(&self.live).load(Ordering::Acquire)
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Brings the listener up and marks the bridge as wanted. Returns the bound
    /// port; starting an already running bridge just reports its port.
    pub fn start(self: &Arc<Self>) -> Result<u16, BridgeError> {
        self.wanted.store(true, Ordering::Release);
        self.try_start()
    }

    pub(super) fn try_start(self: &Arc<Self>) -> Result<u16, BridgeError> {
        self.check_start_allowed()?;
        let mut slot = lock(&self.listener);
        // The reset flag is raised before the slot is taken, so this second
        // look closes the window between the first check and the lock.
        self.check_start_allowed()?;

        // Every transition happens under the slot lock, so Starting and
        // Stopping are never observed here.
        let current = self.state();
        match current {
            LifecycleState::Running => {
                if let Some(handle) = slot.as_ref() {
                    return Ok(handle.port());
                }
            }
            LifecycleState::ResetPending => {
                return Err(BridgeError::Suppressed(SuppressReason::ResetPending))
            }
            _ => {}
        }
        if !self.transition(current, LifecycleState::Starting) {
            return Err(BridgeError::Suppressed(SuppressReason::ResetPending));
        }
        self.start_count.fetch_add(1, Ordering::Relaxed);

        let bound = bind_with_fallback(&self.config)
            .and_then(|listener| ListenerHandle::spawn(self.clone(), listener));
        match bound {
            Ok(handle) => {
                let port = handle.port();
                *lock(&self.live) = handle.probe();
                self.port.store(port, Ordering::Release);
                *slot = Some(handle);
                self.transition(LifecycleState::Starting, LifecycleState::Running);
                info!("[Conduit] Bridge running on port {port}");
                Ok(port)
            }
            Err(e) => {
                self.transition(LifecycleState::Starting, LifecycleState::Stopped);
                warn!("[Conduit] Bridge failed to start: {e}");
                Err(e)
            }
        }
    }

    fn check_start_allowed(&self) -> Result<(), BridgeError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(BridgeError::Suppressed(SuppressReason::ShuttingDown));
        }
        if self.is_reset_pending() {
            return Err(BridgeError::Suppressed(SuppressReason::ResetPending));
        }
        if self.is_compiling() {
            return Err(BridgeError::Suppressed(SuppressReason::Compiling));
        }
        Ok(())
    }

    /// Stops the listener and marks the bridge as not wanted, so the health
    /// monitor leaves it down.
    pub fn stop(&self, mode: StopMode) {
        self.wanted.store(false, Ordering::Release);
        self.halt(mode);
    }

    /// Closes the listener without touching the wanted flag. Returns false if
    /// there was nothing to stop.
    pub(super) fn halt(&self, mode: StopMode) -> bool {
        let mut slot = lock(&self.listener);
        if !self.transition(LifecycleState::Running, LifecycleState::Stopping) {
            return false;
        }
        self.port.store(0, Ordering::Release);
        if let Some(mut handle) = slot.take() {
            let port = handle.port();
            handle.shutdown();
            if let StopMode::Drain(grace) = mode {
                if !handle.join(grace) {
                    warn!(
                        "[Conduit] Accept loop on port {port} still busy after {}ms, giving up",
                        grace.as_millis()
                    );
                }
            }
            info!("[Conduit] Bridge on port {port} stopped");
        }
        self.transition(LifecycleState::Stopping, LifecycleState::Stopped);
        true
    }

    /// Host is about to tear the authorized context down.
    pub(super) fn on_before_reset(&self) {
        let (dropped, failed) = {
            let _admission = lock(&self.admission);
            if self.reset_pending.swap(true, Ordering::AcqRel) {
                return;
            }
            (self.queue.clear(), self.pending.fail_all())
        };
        self.halt(StopMode::Drain(self.config.stop_grace));
        {
            let _slot = lock(&self.listener);
            let current = self.state();
            self.transition(current, LifecycleState::ResetPending);
        }
        info!(
            "[Conduit] Runtime reset pending: dropped {dropped} queued job(s), \
             released {failed} waiting request(s)"
        );
    }

    /// Host finished rebuilding the authorized context.
    pub(super) fn on_after_reset(self: &Arc<Self>) {
        {
            let _slot = lock(&self.listener);
            if !self.is_reset_pending() {
                return;
            }
            self.transition(LifecycleState::ResetPending, LifecycleState::Stopped);
            self.reset_pending.store(false, Ordering::Release);
        }
        if !self.wanted.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.try_start() {
            warn!("[Conduit] Restart after runtime reset failed: {e}");
        }
    }

    #[cfg(test)]
    pub(super) fn sever_listener(&self) {
        if let Some(handle) = lock(&self.listener).as_mut() {
            handle.shutdown();
            handle.join(Duration::from_secs(2));
        }
    }
}
