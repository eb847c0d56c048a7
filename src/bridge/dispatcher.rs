use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use bevy::prelude::*;

use super::{panic_message, Bridge, HealthAction};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub executed: usize,
    pub failed: usize,
    pub health: Option<HealthAction>,
}

/// Per-tick consumer of the work queue. Lives as a resource on the
/// authorized context and never blocks or sleeps.
#[derive(Resource)]
pub struct Dispatcher {
    bridge: Arc<Bridge>,
    last_health_check: Instant,
}

impl Dispatcher {
    pub fn new(bridge: Arc<Bridge>) -> Self {
        Self {
            bridge,
            last_health_check: Instant::now(),
        }
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    pub fn tick(&mut self, world: &mut World) -> TickReport {
        let mut report = TickReport::default();

        // The queue lock is released before any job runs.
        for job in self.bridge.queue.drain() {
            match catch_unwind(AssertUnwindSafe(|| job(world))) {
                Ok(()) => report.executed += 1,
                Err(panic) => {
                    report.failed += 1;
                    error!(
                        "[Conduit] Queued job panicked: {}",
                        panic_message(panic.as_ref())
                    );
                }
            }
        }

        report.health = self.maybe_check_health(Instant::now());
        report
    }

    fn maybe_check_health(&mut self, now: Instant) -> Option<HealthAction> {
        if now.duration_since(self.last_health_check) < self.bridge.config.health_interval {
            return None;
        }
        let action = self.bridge.check_health();
        // A deferred check stays due so it runs as soon as the host settles.
        if action != HealthAction::Deferred {
            self.last_health_check = now;
        }
        Some(action)
    }
}

/// Exclusive system: drains the bridge's work queue with full world access.
pub fn run_dispatcher(world: &mut World) {
    world.resource_scope(|world, mut dispatcher: Mut<Dispatcher>| {
        dispatcher.tick(world);
    });
}
