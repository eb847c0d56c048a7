use super::*;
use crate::test_support::{bridge_with, config_on, tick_until};
use serde_json::json;
use std::collections::HashSet;
use std::net::TcpListener;

#[derive(Resource, Default)]
struct Calls(usize);

async fn wait_for_pending(bridge: &Bridge, count: usize) {
    while bridge.pending_requests() < count {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_each_get_their_own_result() {
    let (bridge, mut dispatcher) = bridge_with(config_on(0), HandlerRegistry::builtin());
    let mut world = World::new();
    world.init_resource::<Calls>();

    let callers: Vec<_> = (0..64u64)
        .map(|i| {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .call_on_authorized(move |world| {
                        world.resource_mut::<Calls>().0 += 1;
                        Ok(json!(i * 10))
                    })
                    .await
            })
        })
        .collect();

    let results = tick_until(&mut dispatcher, &mut world, async move {
        let mut results = Vec::new();
        for caller in callers {
            results.push(caller.await.expect("join"));
        }
        results
    })
    .await;

    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.expect("payload"), json!(i as u64 * 10));
    }
    assert_eq!(world.resource::<Calls>().0, 64);
    assert_eq!(bridge.pending_requests(), 0);
}

#[tokio::test]
async fn timed_out_request_leaves_no_trace() {
    let (bridge, mut dispatcher) = bridge_with(config_on(0), HandlerRegistry::builtin());
    let mut world = World::new();
    world.init_resource::<Calls>();

    let result = bridge
        .call_on_authorized_with_timeout(Duration::from_millis(50), |world| {
            world.resource_mut::<Calls>().0 += 1;
            Ok(json!("late"))
        })
        .await;
    assert!(matches!(result, Err(BridgeError::Timeout { .. })));
    assert_eq!(bridge.pending_requests(), 0);
    assert_eq!(bridge.queued_jobs(), 1);

    // The job still runs once, and its result is dropped.
    let report = dispatcher.tick(&mut world);
    assert_eq!(report.executed, 1);
    assert_eq!(world.resource::<Calls>().0, 1);
    assert_eq!(bridge.pending_requests(), 0);
    assert_eq!(dispatcher.tick(&mut world).executed, 0);
}

#[tokio::test]
async fn handler_errors_and_panics_reach_the_caller() {
    let (bridge, mut dispatcher) = bridge_with(config_on(0), HandlerRegistry::builtin());
    let mut world = World::new();

    let err = tick_until(
        &mut dispatcher,
        &mut world,
        bridge.call_on_authorized(|_world| Err(HandlerError::invalid_params("missing 'value'"))),
    )
    .await
    .expect_err("handler error");
    assert_eq!(err.kind(), "invalid_params");

    let err = tick_until(
        &mut dispatcher,
        &mut world,
        bridge.call_on_authorized(|_world| -> Result<Value, HandlerError> { panic!("boom") }),
    )
    .await
    .expect_err("panic");
    assert_eq!(err.kind(), "panic");
    assert!(err.to_string().contains("boom"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reset_releases_waiters_and_refuses_new_calls() {
    let (bridge, mut dispatcher) = bridge_with(config_on(0), HandlerRegistry::builtin());
    let mut world = World::new();

    let waiter = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.call_on_authorized(|_world| Ok(json!(1))).await })
    };
    wait_for_pending(&bridge, 1).await;

    bridge.signals().notify_before_reset();
    assert!(bridge.is_reset_pending());
    assert_eq!(bridge.state(), LifecycleState::ResetPending);
    assert_eq!(bridge.queued_jobs(), 0);
    let released = waiter.await.expect("join");
    assert!(matches!(released, Err(BridgeError::Reset { .. })));

    let refused = bridge.call_on_authorized(|_world| Ok(json!(2))).await;
    assert!(matches!(
        refused,
        Err(BridgeError::Unavailable(SuppressReason::ResetPending))
    ));
    assert_eq!(dispatcher.tick(&mut world).executed, 0);

    bridge.signals().notify_after_reset();
    assert!(!bridge.is_reset_pending());
    let ok = tick_until(
        &mut dispatcher,
        &mut world,
        bridge.call_on_authorized(|_world| Ok(json!(3))),
    )
    .await;
    assert_eq!(ok.expect("payload"), json!(3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn calls_racing_a_reset_never_run_after_being_released() {
    let (bridge, mut dispatcher) = bridge_with(config_on(0), HandlerRegistry::builtin());
    let mut world = World::new();
    let ran = Arc::new(Mutex::new(HashSet::new()));

    let callers: Vec<_> = (0..200u64)
        .map(|i| {
            let bridge = bridge.clone();
            let ran = ran.clone();
            tokio::spawn(async move {
                let result = bridge
                    .call_on_authorized(move |_world| {
                        lock(&ran).insert(i);
                        Ok(json!(i))
                    })
                    .await;
                (i, result)
            })
        })
        .collect();

    wait_for_pending(&bridge, 1).await;
    bridge.signals().notify_before_reset();
    bridge.signals().notify_after_reset();

    let results = tick_until(&mut dispatcher, &mut world, async move {
        let mut results = Vec::new();
        for caller in callers {
            results.push(caller.await.expect("join"));
        }
        results
    })
    .await;

    let ran = lock(&ran);
    for (i, result) in results {
        match result {
            Ok(value) => {
                assert_eq!(value, json!(i));
                assert!(ran.contains(&i), "call {i} succeeded without running");
            }
            Err(BridgeError::Reset { .. })
            | Err(BridgeError::Unavailable(SuppressReason::ResetPending)) => {
                assert!(!ran.contains(&i), "call {i} was released but still ran");
            }
            Err(other) => panic!("call {i} failed unexpectedly: {other}"),
        }
    }
    assert_eq!(bridge.queued_jobs(), 0);
    assert_eq!(bridge.pending_requests(), 0);
}

#[test]
fn reset_suppresses_starts_from_any_thread() {
    let (bridge, _dispatcher) = bridge_with(config_on(38300), HandlerRegistry::builtin());
    bridge.start().expect("start");
    assert_eq!(bridge.status().start_count, 1);

    bridge.signals().notify_before_reset();
    assert_eq!(bridge.state(), LifecycleState::ResetPending);
    assert!(!bridge.is_listening());
    assert_eq!(bridge.port(), None);

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let bridge = bridge.clone();
            std::thread::spawn(move || bridge.start())
        })
        .collect();
    for attempt in attempts {
        let result = attempt.join().expect("join");
        assert!(matches!(
            result,
            Err(BridgeError::Suppressed(SuppressReason::ResetPending))
        ));
    }
    assert_eq!(bridge.check_health(), HealthAction::Deferred);
    assert_eq!(bridge.status().start_count, 1);
    assert_eq!(bridge.state(), LifecycleState::ResetPending);

    bridge.signals().notify_after_reset();
    assert_eq!(bridge.state(), LifecycleState::Running);
    assert!(bridge.is_listening());
    assert_eq!(bridge.status().start_count, 2);

    bridge.stop(StopMode::Drain(Duration::from_secs(1)));
    assert_eq!(bridge.state(), LifecycleState::Stopped);
}

#[test]
fn after_reset_leaves_an_unwanted_bridge_down() {
    let (bridge, _dispatcher) = bridge_with(config_on(38320), HandlerRegistry::builtin());
    bridge.signals().notify_before_reset();
    bridge.signals().notify_before_reset();
    bridge.signals().notify_after_reset();
    assert_eq!(bridge.state(), LifecycleState::Stopped);
    assert_eq!(bridge.status().start_count, 0);
    // A stray second notification is ignored.
    bridge.signals().notify_after_reset();
    assert_eq!(bridge.state(), LifecycleState::Stopped);
}

#[test]
fn health_check_restarts_a_severed_listener() {
    let config = BridgeConfig {
        health_interval: Duration::ZERO,
        ..config_on(38400)
    };
    let (bridge, mut dispatcher) = bridge_with(config, HandlerRegistry::builtin());
    let mut world = World::new();
    bridge.start().expect("start");

    bridge.sever_listener();
    assert_eq!(bridge.state(), LifecycleState::Running);
    assert!(!bridge.is_listening());

    let report = dispatcher.tick(&mut world);
    assert_eq!(report.health, Some(HealthAction::Restarted { ok: true }));
    assert!(bridge.is_listening());
    assert_eq!(bridge.state(), LifecycleState::Running);
    assert_eq!(bridge.status().start_count, 2);

    assert_eq!(
        dispatcher.tick(&mut world).health,
        Some(HealthAction::Healthy)
    );
    bridge.stop(StopMode::Drain(Duration::from_secs(1)));
}

#[test]
fn health_check_respects_explicit_stop() {
    let (bridge, _dispatcher) = bridge_with(config_on(38420), HandlerRegistry::builtin());
    bridge.start().expect("start");

    // Dropped without an explicit stop: the bridge is still wanted.
    assert!(bridge.halt(StopMode::Drain(Duration::from_secs(1))));
    assert_eq!(bridge.state(), LifecycleState::Stopped);
    assert_eq!(bridge.check_health(), HealthAction::Started { ok: true });
    assert_eq!(bridge.state(), LifecycleState::Running);

    bridge.stop(StopMode::Drain(Duration::from_secs(1)));
    assert_eq!(bridge.check_health(), HealthAction::Healthy);
    assert_eq!(bridge.state(), LifecycleState::Stopped);
}

#[test]
fn start_falls_back_when_the_preferred_port_is_taken() {
    let squatter = TcpListener::bind(("127.0.0.1", 38500)).expect("bind squatter");
    let (bridge, _dispatcher) = bridge_with(config_on(38500), HandlerRegistry::builtin());

    let port = bridge.start().expect("start");
    assert_ne!(port, 38500);
    assert!((38501..38520).contains(&port));
    assert_eq!(bridge.port(), Some(port));
    assert_eq!(
        bridge.status().url.as_deref(),
        Some(format!("http://127.0.0.1:{port}/bridge").as_str())
    );

    // Starting again while running reports the same port.
    assert_eq!(bridge.start().expect("restart"), port);
    assert_eq!(bridge.status().start_count, 1);

    bridge.stop(StopMode::Drain(Duration::from_secs(1)));
    drop(squatter);
}

#[test]
fn exhausted_port_range_leaves_the_bridge_stopped() {
    let squatter = TcpListener::bind(("127.0.0.1", 38600)).expect("bind squatter");
    let config = BridgeConfig {
        port_scan: 1,
        ..config_on(38600)
    };
    let (bridge, _dispatcher) = bridge_with(config, HandlerRegistry::builtin());

    let err = bridge.start().expect_err("no port");
    assert!(matches!(err, BridgeError::NoFreePort { first: 38600, last: 38600 }));
    assert_eq!(bridge.state(), LifecycleState::Stopped);
    assert!(!bridge.is_listening());
    assert_eq!(bridge.check_health(), HealthAction::Started { ok: false });
    drop(squatter);
}

#[test]
fn compilation_gates_starts_and_records_results() {
    use crate::buffers::{CompilationRecord, Diagnostic, Severity};

    let (bridge, _dispatcher) = bridge_with(config_on(38700), HandlerRegistry::builtin());
    bridge.signals().notify_compilation_started();
    assert!(bridge.is_compiling());
    assert!(matches!(
        bridge.start(),
        Err(BridgeError::Suppressed(SuppressReason::Compiling))
    ));
    assert_eq!(bridge.check_health(), HealthAction::Deferred);

    let record = CompilationRecord::new(
        "scripts",
        vec![Diagnostic {
            severity: Severity::Error,
            message: "unexpected token".to_string(),
            file: "mover.rhai".to_string(),
            line: 3,
            column: 7,
        }],
    );
    bridge.signals().notify_compilation_finished(&record);
    assert!(!bridge.is_compiling());
    let snapshot = bridge.buffers().compilations();
    assert!(snapshot.latest.is_some_and(|latest| latest.has_errors()));

    // Still wanted from the suppressed attempt, so health brings it up.
    assert_eq!(bridge.check_health(), HealthAction::Started { ok: true });
    bridge.stop(StopMode::Drain(Duration::from_secs(1)));
}

#[test]
fn shutdown_detaches_from_the_host() {
    let (bridge, _dispatcher) = bridge_with(config_on(38800), HandlerRegistry::builtin());
    let signals = bridge.signals().clone();
    assert_eq!(signals.subscriber_count(), 1);
    bridge.start().expect("start");

    bridge.shutdown();
    assert_eq!(signals.subscriber_count(), 0);
    assert_eq!(bridge.state(), LifecycleState::Stopped);
    assert!(matches!(
        bridge.start(),
        Err(BridgeError::Suppressed(SuppressReason::ShuttingDown))
    ));

    // Signals after shutdown reach nobody.
    signals.notify_before_reset();
    assert!(!bridge.is_reset_pending());
}

#[test]
fn dropped_bridge_does_not_outlive_its_subscription() {
    let signals = HostSignals::default();
    let bridge = Bridge::new(config_on(0), HandlerRegistry::builtin(), signals.clone());
    let weak = Arc::downgrade(&bridge);
    drop(bridge);
    assert!(weak.upgrade().is_none());
    // The stale subscriber is still registered but inert.
    signals.notify_before_reset();
    signals.notify_log(&LogRecord::new(
        crate::buffers::Severity::Info,
        "after drop",
        "",
    ));
}

#[test]
fn plugin_reads_its_config_file_when_built() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("conduit.json");
    let plugin = BridgePlugin::from_file(&path);

    // Written after the plugin exists: nothing is read until `build`.
    std::fs::write(&path, r#"{"port": 38950, "log_capacity": 3, "auto_start": false}"#)
        .expect("write");
    let mut app = App::new();
    app.add_plugins(plugin);

    let bridge = app.world().resource::<BridgeHandle>().0.clone();
    assert_eq!(bridge.config().port, 38950);
    assert_eq!(bridge.config().log_capacity, 3);
    assert_eq!(bridge.state(), LifecycleState::Uninitialized);
    assert!(app.world().get_resource::<Dispatcher>().is_some());
}
