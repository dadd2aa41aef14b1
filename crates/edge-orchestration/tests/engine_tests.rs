//! Engine behaviour: breaker gating, run loop, app control and shutdown

use edge_orchestration::{
    App, CircuitBreakerConfig, Driver, DriverContext, EngineConfig, Error, ManualClock,
    MemoryDriver, MemoryOp, PassOutcome, ReconciliationEngine, RetryConfig, Service,
    ServiceState, Settings, SkipReason, TargetState,
};
use std::sync::Arc;
use std::time::Duration;

fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 2,
        base_delay_ms: 1,
        max_delay_ms: 1,
        ..RetryConfig::default()
    }
}

fn engine_config() -> EngineConfig {
    EngineConfig {
        init_timeout: Duration::from_secs(1),
        shutdown_timeout: Duration::from_secs(5),
        init_retry: fast_retry(),
    }
}

fn web_target(settings: Settings) -> TargetState {
    TargetState {
        settings,
        ..TargetState::default()
    }
    .with_app(
        App::new("1", "web")
            .with_service(Service::new("1", "a", "api", "api:1"))
            .with_service(Service::new("1", "b", "worker", "worker:1")),
    )
}

fn settings() -> Settings {
    Settings {
        retry: fast_retry(),
        ..Settings::default()
    }
}

async fn ready_engine() -> ReconciliationEngine<MemoryDriver> {
    let engine = ReconciliationEngine::new(Arc::new(MemoryDriver::new()), engine_config());
    engine.init().await.unwrap();
    engine
}

#[cfg(feature = "smol")]
#[smol_potat::test]
async fn test_init_retries_then_reports_unreachable() {
    let driver = Arc::new(MemoryDriver::new());
    driver.set_reachable(false);
    let engine = ReconciliationEngine::new(driver.clone(), engine_config());

    assert!(matches!(engine.init().await, Err(Error::BackendUnreachable(_))));
    assert!(!driver.is_ready());

    driver.set_reachable(true);
    engine.init().await.unwrap();
    assert!(driver.is_ready());
}

#[cfg(feature = "smol")]
#[smol_potat::test]
async fn test_breaker_skips_passes_after_repeated_driver_failures() {
    let clock = Arc::new(ManualClock::at_epoch());
    let driver = Arc::new(MemoryDriver::with_context(
        DriverContext::new().with_clock(clock.clone()),
    ));
    let engine = ReconciliationEngine::new(driver.clone(), engine_config());
    engine.init().await.unwrap();

    let settings = Settings {
        circuit_breaker: CircuitBreakerConfig {
            max_failures: 2,
            cooldown_ms: 60_000,
        },
        ..settings()
    };
    engine.set_target_state(web_target(settings)).await.unwrap();

    driver.set_reachable(false);
    for _ in 0..2 {
        assert!(matches!(
            engine.reconcile_once().await,
            Err(Error::BackendUnreachable(_))
        ));
    }
    assert!(engine.is_circuit_open().await);
    assert_eq!(
        engine.reconcile_once().await.unwrap(),
        PassOutcome::Skipped(SkipReason::CircuitOpen)
    );

    driver.set_reachable(true);
    clock.advance(Duration::from_millis(59_999));
    assert!(engine.is_circuit_open().await);
    clock.advance(Duration::from_millis(1));

    match engine.reconcile_once().await.unwrap() {
        PassOutcome::Completed(result) => assert_eq!(result.services_created, 2),
        other => panic!("expected a completed pass, got {:?}", other),
    }
}

#[cfg(feature = "smol")]
#[smol_potat::test]
async fn test_run_loop_reacts_to_new_target_and_stops() {
    let engine = ready_engine().await;
    let (stop_tx, stop_rx) = async_channel::bounded::<()>(1);

    let driver = engine.driver().clone();
    let control = async {
        smol::Timer::after(Duration::from_millis(20)).await;
        let settings = Settings {
            poll_interval_ms: 600_000,
            ..settings()
        };
        engine.set_target_state(web_target(settings)).await.unwrap();

        for _ in 0..200 {
            if driver.instance_count() == 2 {
                break;
            }
            smol::Timer::after(Duration::from_millis(5)).await;
        }
        stop_tx.send(()).await.unwrap();
    };

    futures::join!(engine.run(stop_rx), control);
    assert_eq!(driver.instance_count(), 2);
}

#[cfg(feature = "smol")]
#[smol_potat::test]
async fn test_app_control_uses_per_service_calls() {
    let engine = ready_engine().await;
    engine.set_target_state(web_target(settings())).await.unwrap();
    engine.reconcile_once().await.unwrap();
    let driver = engine.driver().clone();
    driver.clear_calls();

    let report = engine.stop_app("1").await.unwrap();
    assert_eq!(report.succeeded, vec!["api", "worker"]);
    assert!(report.failed.is_empty());
    assert_eq!(driver.calls_of(MemoryOp::Stop), vec!["1/a", "1/b"]);
    let api = Service::new("1", "a", "api", "api:1").key();
    assert_eq!(
        driver.instance(&api).unwrap().observed_state(),
        ServiceState::Stopped
    );

    engine.start_app("1").await.unwrap();
    assert_eq!(driver.calls_of(MemoryOp::Start), vec!["1/a", "1/b"]);

    engine.restart_app("1").await.unwrap();
    assert_eq!(driver.calls_of(MemoryOp::Restart), vec!["1/a", "1/b"]);

    assert!(matches!(
        engine.start_app("missing").await,
        Err(Error::AppNotFound(_))
    ));
}

#[cfg(feature = "smol")]
#[smol_potat::test]
async fn test_app_control_isolates_service_failures() {
    let engine = ready_engine().await;
    engine.set_target_state(web_target(settings())).await.unwrap();
    engine.reconcile_once().await.unwrap();
    let driver = engine.driver().clone();
    driver.fail(MemoryOp::Stop, "1/a", || Error::Unsupported {
        driver: "memory".into(),
        operation: "stop_service".into(),
    });

    let report = engine.stop_app("1").await.unwrap();
    assert_eq!(report.succeeded, vec!["worker"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].service_name, "api");
}

#[cfg(feature = "smol")]
#[smol_potat::test]
async fn test_invalid_target_keeps_previous_snapshot() {
    let engine = ready_engine().await;
    let version = engine.set_target_state(web_target(settings())).await.unwrap();

    let mut broken = web_target(settings());
    if let Some(app) = broken.apps.get_mut("1") {
        app.services[1].service_name = "api".into();
    }
    assert!(matches!(
        engine.set_target_state(broken).await,
        Err(Error::InvalidTargetState(_))
    ));

    let active = engine.driver().get_target_state().await;
    assert_eq!(active.version, version);
    assert_eq!(active.state.apps["1"].services[1].service_name, "worker");
}

#[cfg(feature = "smol")]
#[smol_potat::test]
async fn test_shutdown_aborts_stuck_operations_and_is_idempotent() {
    let engine = ready_engine().await;
    engine.set_target_state(web_target(settings())).await.unwrap();
    engine.driver().set_latency(Duration::from_secs(10));

    let shutdown = async {
        smol::Timer::after(Duration::from_millis(20)).await;
        engine.shutdown(Duration::from_millis(50)).await
    };
    let (pass, closed) = futures::join!(engine.reconcile_once(), shutdown);

    assert!(matches!(pass, Err(Error::ShutDown)));
    closed.unwrap();
    assert!(engine.is_shut_down());
    assert!(!engine.driver().is_ready());
    assert_eq!(engine.driver().base().in_flight(), 0);

    engine.shutdown(Duration::from_millis(50)).await.unwrap();
    assert!(matches!(engine.reconcile_once().await, Err(Error::ShutDown)));
}
