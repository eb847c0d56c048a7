//! Cross-thread command bridge: request workers hand closures to the
//! authorized context (the main `World`) and wait for their results.

pub mod correlation;
pub mod dispatcher;
pub mod handlers;
mod health;
mod lifecycle;
pub mod queue;
#[cfg(test)]
mod tests;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bevy::prelude::*;
use serde::Serialize;
use serde_json::Value;

use crate::api::ListenerHandle;
use crate::buffers::{CompilationRecord, EventBuffers, LogRecord};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, HandlerError, SuppressReason};
use crate::host::{HostListener, HostSignals, SubscriptionId};
use correlation::{CorrelationTable, Payload};
use dispatcher::{run_dispatcher, Dispatcher};
use handlers::{Handler, HandlerRegistry, Route};
pub use health::HealthAction;
pub use lifecycle::{LifecycleState, StopMode};
use queue::WorkQueue;

/// Locks a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}

/// Runs a handler, turning a panic into a handler error.
fn run_guarded(f: impl FnOnce() -> Result<Value, HandlerError>) -> Payload {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result.map_err(BridgeError::from),
        Err(panic) => Err(HandlerError::panicked(panic_message(panic.as_ref())).into()),
    }
}

/// The process-wide bridge context. Built once at startup and shared by handle.
pub struct Bridge {
    config: BridgeConfig,
    handlers: HandlerRegistry,
    queue: WorkQueue,
    pending: CorrelationTable,
    buffers: EventBuffers,
    signals: HostSignals,
    subscription: Mutex<Option<SubscriptionId>>,
    state: AtomicU8,
    /// Set while the host is between "about to reset" and "reset finished".
    reset_pending: AtomicBool,
    compiling: AtomicBool,
    /// Whether the bridge should be up. Cleared only by an explicit stop.
    wanted: AtomicBool,
    /// Serializes request admission against the start of a reset.
    admission: Mutex<()>,
    shutting_down: AtomicBool,
    start_count: AtomicU64,
    /// Held for the whole of every lifecycle transition.
    listener: Mutex<Option<ListenerHandle>>,
    /// Readable without the transition lock; 0 when nothing is bound.
    port: AtomicU16,
    /// Liveness probe of the current accept loop.
    live: Mutex<Arc<AtomicBool>>,
}

#[derive(Serialize, Clone, Debug)]
pub struct BridgeStatus {
    pub state: LifecycleState,
    pub listening: bool,
    pub port: Option<u16>,
    pub url: Option<String>,
    pub pending_requests: usize,
    pub oldest_pending_ms: Option<u64>,
    pub queued_jobs: usize,
    pub reset_pending: bool,
    pub compiling: bool,
    pub start_count: u64,
}

impl Bridge {
    pub fn new(config: BridgeConfig, handlers: HandlerRegistry, signals: HostSignals) -> Arc<Self> {
        let buffers = EventBuffers::new(config.log_capacity, config.compilation_capacity);
        Arc::new_cyclic(|weak: &Weak<Bridge>| {
            let subscription = signals.subscribe(Arc::new(BridgeSubscriber {
                bridge: weak.clone(),
            }));
            Self {
                config,
                handlers,
                queue: WorkQueue::default(),
                pending: CorrelationTable::default(),
                buffers,
                signals,
                subscription: Mutex::new(Some(subscription)),
                state: AtomicU8::new(LifecycleState::Uninitialized as u8),
                reset_pending: AtomicBool::new(false),
                compiling: AtomicBool::new(false),
                wanted: AtomicBool::new(false),
                admission: Mutex::new(()),
                shutting_down: AtomicBool::new(false),
                start_count: AtomicU64::new(0),
                listener: Mutex::new(None),
                port: AtomicU16::new(0),
                live: Mutex::new(Arc::new(AtomicBool::new(false))),
            }
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn buffers(&self) -> &EventBuffers {
        &self.buffers
    }

    pub fn signals(&self) -> &HostSignals {
        &self.signals
    }

    pub fn is_compiling(&self) -> bool {
        self.compiling.load(Ordering::Acquire)
    }

    pub fn is_reset_pending(&self) -> bool {
        self.reset_pending.load(Ordering::Acquire)
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn queued_jobs(&self) -> usize {
        self.queue.len()
    }

    pub fn status(&self) -> BridgeStatus {
        let port = self.port();
        BridgeStatus {
            state: self.state(),
            listening: self.is_listening(),
            port,
            url: port.map(|p| self.config.base_url(p)),
            pending_requests: self.pending.len(),
            oldest_pending_ms: self.pending.oldest_age().map(|d| d.as_millis() as u64),
            queued_jobs: self.queue.len(),
            reset_pending: self.is_reset_pending(),
            compiling: self.is_compiling(),
            start_count: self.start_count.load(Ordering::Relaxed),
        }
    }

    /// Runs `f` on the authorized context and waits for its result, using the
    /// configured request timeout.
    pub async fn call_on_authorized<F>(&self, f: F) -> Payload
    where
        F: FnOnce(&mut World) -> Result<Value, HandlerError> + Send + 'static,
    {
        self.call_on_authorized_with_timeout(self.config.request_timeout, f)
            .await
    }

    /// The only sanctioned way for a worker to reach authorized-context state.
    /// `f` runs at most once. After a timeout the request leaves no trace and
    /// a late result is dropped.
    pub async fn call_on_authorized_with_timeout<F>(&self, timeout: Duration, f: F) -> Payload
    where
        F: FnOnce(&mut World) -> Result<Value, HandlerError> + Send + 'static,
    {
        let (id, rx) = {
            // Registering and queueing happen as one step with respect to a
            // reset, so a request released by the reset never runs later.
            let _admission = lock(&self.admission);
            if self.is_reset_pending() {
                return Err(BridgeError::Unavailable(SuppressReason::ResetPending));
            }
            let (id, rx) = self.pending.register();
            let table = self.pending.clone();
            self.queue.push(Box::new(move |world: &mut World| {
                let payload = run_guarded(|| f(world));
                if !table.resolve(id, payload) {
                    debug!("[Conduit] Discarding late result for {id}");
                }
            }));
            (id, rx)
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(_)) => {
                self.pending.forget(id);
                Err(BridgeError::Cancelled { id })
            }
            Err(_) => {
                self.pending.forget(id);
                warn!(
                    "[Conduit] {id} timed out after {}ms",
                    timeout.as_millis()
                );
                Err(BridgeError::Timeout { id, after: timeout })
            }
        }
    }

    /// Looks up and runs the handler registered for `route`/`name`.
    pub async fn dispatch(&self, route: Route, name: &str, params: Value) -> Payload {
        let handler = self
            .handlers
            .get(route, name)
            .ok_or_else(|| BridgeError::UnknownHandler {
                route,
                name: name.to_string(),
            })?;
        match handler {
            Handler::Inline(f) => run_guarded(|| f(self, params)),
            Handler::Authorized(f) => {
                self.call_on_authorized(move |world| f(world, params))
                    .await
            }
        }
    }

    /// Stops the listener, waiting for it, and detaches from host signals.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.stop(StopMode::Drain(self.config.stop_grace));
        if let Some(id) = lock(&self.subscription).take() {
            self.signals.unsubscribe(id);
        }
        self.queue.clear();
        self.pending.fail_all();
    }
}

/// Host signal subscription. Holds the bridge weakly so the host's registry
/// never keeps a dropped bridge alive.
struct BridgeSubscriber {
    bridge: Weak<Bridge>,
}

impl HostListener for BridgeSubscriber {
    fn before_reset(&self) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.on_before_reset();
        }
    }

    fn after_reset(&self) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.on_after_reset();
        }
    }

    fn compilation_started(&self) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.compiling.store(true, Ordering::Release);
        }
    }

    fn compilation_finished(&self, record: &CompilationRecord) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.compiling.store(false, Ordering::Release);
            bridge.buffers.record_compilation(record.clone());
        }
    }

    fn log(&self, record: &LogRecord) {
        if let Some(bridge) = self.bridge.upgrade() {
            bridge.buffers.push_log(record.clone());
        }
    }
}

/// Shared handle to the bridge for systems and handlers.
#[derive(Resource, Clone)]
pub struct BridgeHandle(pub Arc<Bridge>);

pub struct BridgePlugin {
    config: ConfigSource,
    handlers: HandlerRegistry,
}

/// Where the plugin takes its config from. Files are read during `build`,
/// after the host has installed its log subscriber.
enum ConfigSource {
    Given(BridgeConfig),
    File(PathBuf),
}

impl Default for BridgePlugin {
    /// Config from `BridgeConfig::default_path()` plus env overrides.
    fn default() -> Self {
        Self::from_file(BridgeConfig::default_path())
    }
}

impl BridgePlugin {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config: ConfigSource::Given(config),
            handlers: HandlerRegistry::builtin(),
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            config: ConfigSource::File(path.into()),
            handlers: HandlerRegistry::builtin(),
        }
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }
}

impl Plugin for BridgePlugin {
    fn build(&self, app: &mut App) {
        let signals = {
            let signals = app
                .world_mut()
                .get_resource_or_insert_with(HostSignals::default);
            HostSignals::clone(&signals)
        };
        let config = match &self.config {
            ConfigSource::Given(config) => config.clone(),
            ConfigSource::File(path) => BridgeConfig::load_from(path),
        };
        let auto_start = config.auto_start;
        let bridge = Bridge::new(config, self.handlers.clone(), signals);

        if auto_start {
            match bridge.start() {
                Ok(port) => info!(
                    "[Conduit] Listening on {}",
                    bridge.config().base_url(port)
                ),
                Err(e) => warn!("[Conduit] Bridge not started: {e}"),
            }
        }

        app.insert_resource(BridgeHandle(bridge.clone()))
            .insert_resource(Dispatcher::new(bridge))
            .add_systems(Update, run_dispatcher)
            .add_systems(Last, shutdown_on_exit);
    }
}

fn shutdown_on_exit(mut exits: EventReader<AppExit>, bridge: Res<BridgeHandle>) {
    if exits.read().next().is_some() {
        info!("[Conduit] Host exiting, shutting bridge down");
        bridge.0.shutdown();
    }
}
