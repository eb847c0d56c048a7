use std::sync::atomic::Ordering;
use std::sync::Arc;

use bevy::prelude::*;

use super::{Bridge, LifecycleState, StopMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    /// Nothing to do.
    Healthy,
    /// Host is resetting or compiling; checked again on the next tick.
    Deferred,
    /// Bridge was down but wanted; a start was attempted.
    Started { ok: bool },
    /// Bridge claimed Running without a live accept loop; it was restarted.
    Restarted { ok: bool },
}

impl Bridge {
    /// Corrects the two failure shapes the lifecycle can drift into. Never
    /// propagates errors: failures are logged and retried next interval.
    pub fn check_health(self: &Arc<Self>) -> HealthAction {
        if self.is_reset_pending() || self.is_compiling() {
            return HealthAction::Deferred;
        }
        match self.state() {
            LifecycleState::Running if !self.is_listening() => {
                warn!("[Conduit health] Marked running but not listening, restarting");
                self.halt(StopMode::Detach);
                let ok = match self.try_start() {
                    Ok(_) => true,
                    Err(e) => {
                        warn!("[Conduit health] Restart failed: {e}");
                        false
                    }
                };
                HealthAction::Restarted { ok }
            }
            LifecycleState::Uninitialized | LifecycleState::Stopped
                if self.wanted.load(Ordering::Acquire) =>
            {
                info!("[Conduit health] Bridge is down, starting it");
                let ok = match self.try_start() {
                    Ok(_) => true,
                    Err(e) => {
                        warn!("[Conduit health] Start failed: {e}");
                        false
                    }
                };
                HealthAction::Started { ok }
            }
            _ => HealthAction::Healthy,
        }
    }
}
