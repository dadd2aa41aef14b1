//! The reconciliation engine: owns a driver and decides when passes run.

use crate::{
    Error, Result,
    driver::Driver,
    events::Notification,
    model::{
        CurrentState, ReconciliationError, ReconciliationResult, Service, ServiceState,
        TargetState,
    },
    reconcile::{driver_call, instance_of},
    resilience::{CircuitBreaker, CircuitBreakerConfig, Retry, RetryConfig},
    runtime::{sleep, timeout},
};
use async_channel::{Receiver, Sender};
use futures::lock::Mutex;
use futures_lite::future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Engine timing and retry policy
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline for a single driver init attempt
    pub init_timeout: Duration,
    /// Deadline for driver shutdown
    pub shutdown_timeout: Duration,
    /// Attempts made to bring the driver up
    pub init_retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            init_retry: RetryConfig {
                max_attempts: 5,
                ..RetryConfig::default()
            },
        }
    }
}

/// Why a requested pass did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another pass holds the reconciliation lock
    InProgress,
    /// Recent passes failed at the driver level; waiting out the cooldown
    CircuitOpen,
}

/// Outcome of [`ReconciliationEngine::reconcile_once`]
#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    /// The pass ran to completion
    Completed(ReconciliationResult),
    /// The pass was not attempted
    Skipped(SkipReason),
}

/// Result of an app-level start, stop or restart
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppActionReport {
    /// App the action targeted
    pub app_id: String,
    /// Services the action succeeded on
    pub succeeded: Vec<String>,
    /// Services the action failed on
    pub failed: Vec<ReconciliationError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AppAction {
    Start,
    Stop,
    Restart,
}

impl AppAction {
    fn verb(self) -> &'static str {
        match self {
            AppAction::Start => "start",
            AppAction::Stop => "stop",
            AppAction::Restart => "restart",
        }
    }
}

enum Wakeup {
    Tick,
    Poke,
    Stop,
}

/// Drives periodic reconciliation on top of a [`Driver`]
pub struct ReconciliationEngine<D: Driver + ?Sized> {
    driver: Arc<D>,
    config: EngineConfig,
    breaker: Mutex<Arc<CircuitBreaker>>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    shut_down: AtomicBool,
}

impl<D: Driver + ?Sized> ReconciliationEngine<D> {
    /// Engine over `driver`; call [`init`](Self::init) before reconciling
    pub fn new(driver: Arc<D>, config: EngineConfig) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            "reconcile",
            CircuitBreakerConfig::default(),
            driver.base().clock().clone(),
        ));
        let (wake_tx, wake_rx) = async_channel::bounded(1);
        Self {
            driver,
            config,
            breaker: Mutex::new(breaker),
            wake_tx,
            wake_rx,
            shut_down: AtomicBool::new(false),
        }
    }

    /// The driver
    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// Initialize the driver, retrying transient failures
    pub async fn init(&self) -> Result<()> {
        let retry = Retry::new(self.config.init_retry.clone())
            .with_classifier(Error::is_retryable)
            .on_retry(|attempt, delay, error: &Error| {
                warn!(
                    "Driver init attempt {} failed: {}; retrying in {:?}",
                    attempt, error, delay
                )
            });
        retry
            .execute("driver init", || {
                timeout("driver init", self.config.init_timeout, self.driver.init())
            })
            .await?;
        info!("Driver '{}' ready", self.driver.base().name());
        Ok(())
    }

    /// Submit a new target state and wake the run loop
    pub async fn set_target_state(&self, target: TargetState) -> Result<u64> {
        let version = self.driver.set_target_state(target).await?;
        // A full channel already holds a pending wake-up
        let _ = self.wake_tx.try_send(());
        Ok(version)
    }

    /// Observed state of the backend
    pub async fn current_state(&self) -> Result<CurrentState> {
        self.driver.get_current_state().await
    }

    /// Subscribe to driver and reconciler notifications
    pub async fn subscribe(&self) -> Receiver<Notification> {
        self.driver.base().notifier().subscribe().await
    }

    /// Breaker for the active settings, rebuilt when its policy changes
    async fn breaker(&self) -> Arc<CircuitBreaker> {
        let wanted = self
            .driver
            .get_target_state()
            .await
            .state
            .settings
            .circuit_breaker
            .clone();
        let mut breaker = self.breaker.lock().await;
        if breaker.config() != &wanted {
            debug!("Circuit breaker policy changed; resetting breaker");
            *breaker = Arc::new(CircuitBreaker::new(
                "reconcile",
                wanted,
                self.driver.base().clock().clone(),
            ));
        }
        breaker.clone()
    }

    /// Whether passes are currently held back by the circuit breaker
    pub async fn is_circuit_open(&self) -> bool {
        self.breaker().await.is_open()
    }

    /// Run one pass unless the breaker is open or a pass is already running.
    ///
    /// Driver-level failures are returned and counted by the breaker.
    pub async fn reconcile_once(&self) -> Result<PassOutcome> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(Error::ShutDown);
        }
        let breaker = self.breaker().await;
        if breaker.is_open() {
            debug!("Circuit open; skipping reconciliation pass");
            return Ok(PassOutcome::Skipped(SkipReason::CircuitOpen));
        }

        match self.driver.reconcile().await {
            Ok(result) => {
                breaker.record_success();
                Ok(PassOutcome::Completed(result))
            }
            Err(Error::ReconciliationInProgress) => Ok(PassOutcome::Skipped(SkipReason::InProgress)),
            Err(e) => {
                breaker.record_failure();
                Err(e)
            }
        }
    }

    /// Reconcile every poll interval, or sooner when a target arrives, until
    /// `stop` fires or closes or the engine shuts down
    pub async fn run(&self, stop: Receiver<()>) {
        info!("Reconciliation loop started");
        loop {
            match self.reconcile_once().await {
                Ok(PassOutcome::Completed(result)) if !result.is_noop() => debug!(
                    "Pass applied {} changes with {} errors",
                    result.services_created + result.services_updated + result.services_removed,
                    result.errors.len()
                ),
                Ok(PassOutcome::Completed(_)) => debug!("Pass found nothing to do"),
                Ok(PassOutcome::Skipped(reason)) => debug!("Pass skipped: {:?}", reason),
                Err(Error::ShutDown) => break,
                Err(e) => warn!("Reconciliation pass failed: {}", e),
            }

            let interval = self
                .driver
                .get_target_state()
                .await
                .state
                .settings
                .poll_interval_ms
                .max(1);
            let stopped = async {
                let _ = stop.recv().await;
                Wakeup::Stop
            };
            let poked = async {
                let _ = self.wake_rx.recv().await;
                Wakeup::Poke
            };
            let ticked = async {
                sleep(Duration::from_millis(interval)).await;
                Wakeup::Tick
            };
            match future::or(stopped, future::or(poked, ticked)).await {
                Wakeup::Stop => break,
                Wakeup::Poke => debug!("Target state changed; reconciling early"),
                Wakeup::Tick => {}
            }
            if self.shut_down.load(Ordering::SeqCst) {
                break;
            }
        }
        info!("Reconciliation loop stopped");
    }

    /// Start every service of an app
    pub async fn start_app(&self, app_id: &str) -> Result<AppActionReport> {
        self.app_action(app_id, AppAction::Start).await
    }

    /// Stop every service of an app.
    ///
    /// The next pass starts them again unless the target says otherwise.
    pub async fn stop_app(&self, app_id: &str) -> Result<AppActionReport> {
        self.app_action(app_id, AppAction::Stop).await
    }

    /// Restart every service of an app
    pub async fn restart_app(&self, app_id: &str) -> Result<AppActionReport> {
        self.app_action(app_id, AppAction::Restart).await
    }

    async fn app_action(&self, app_id: &str, action: AppAction) -> Result<AppActionReport> {
        let base = self.driver.base();
        base.ensure_ready()?;
        let target = self.driver.get_target_state().await;
        let current = self.driver.get_current_state().await?;
        let declared = target.state.apps.get(app_id);
        let observed = current.apps.get(app_id);
        if declared.is_none() && observed.is_none() {
            return Err(Error::AppNotFound(app_id.to_string()));
        }

        // Declared order first, then anything only the backend knows about
        let mut services: Vec<&Service> = Vec::new();
        if let (Some(declared), Some(observed)) = (declared, observed) {
            services.extend(declared.services.iter().filter_map(|s| observed.service(&s.service_id)));
        }
        if let Some(observed) = observed {
            for service in &observed.services {
                if !services.iter().any(|s| s.service_id == service.service_id) {
                    services.push(service);
                }
            }
        }

        info!("Requested {} of app {} ({} services)", action.verb(), app_id, services.len());
        let settings = &target.state.settings;
        let stop_timeout = Duration::from_secs(settings.stop_timeout_secs);
        let mut report = AppActionReport {
            app_id: app_id.to_string(),
            ..AppActionReport::default()
        };

        for service in services {
            let _guard = base.locks().lock(&service.key()).await;
            let outcome = self.apply(action, service, &settings.retry, stop_timeout).await;
            match outcome {
                Ok(()) => report.succeeded.push(service.service_name.clone()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    base.log_failure(action.verb(), service, &e);
                    let error = base
                        .errors()
                        .record_failure(
                            &service.key(),
                            &e,
                            service.status.as_ref(),
                            &settings.error_backoff,
                        )
                        .await;
                    base.notifier()
                        .emit(Notification::ServiceError {
                            service_name: service.service_name.clone(),
                            error: error.clone(),
                        })
                        .await;
                    report.failed.push(ReconciliationError {
                        service_name: service.service_name.clone(),
                        app_id: service.app_id.clone(),
                        error,
                    });
                }
            }
        }
        Ok(report)
    }

    async fn apply(
        &self,
        action: AppAction,
        service: &Service,
        policy: &RetryConfig,
        stop_timeout: Duration,
    ) -> Result<()> {
        let driver = self.driver.as_ref();
        let notifier = driver.base().notifier();
        let state = service.observed_state();
        let instance = instance_of(service).to_string();

        let run = match action {
            AppAction::Start if state == ServiceState::Running => false,
            AppAction::Start => {
                driver.base().log_action("Starting", service);
                driver_call(driver, policy, "start_service", move || driver.start_service(service))
                    .await?;
                true
            }
            AppAction::Stop if !matches!(state, ServiceState::Running | ServiceState::Paused) => {
                false
            }
            AppAction::Stop => {
                driver.base().log_action("Stopping", service);
                driver.stop_health_monitoring(service).await;
                driver_call(driver, policy, "stop_service", move || {
                    driver.stop_service(service, stop_timeout)
                })
                .await?;
                notifier
                    .emit(Notification::ServiceStopped {
                        service_name: service.service_name.clone(),
                        container_id: instance.clone(),
                        exit_code: None,
                    })
                    .await;
                false
            }
            AppAction::Restart if state == ServiceState::Running => {
                driver.base().log_action("Restarting", service);
                driver_call(driver, policy, "restart_service", move || {
                    driver.restart_service(service, stop_timeout)
                })
                .await?;
                true
            }
            AppAction::Restart => {
                driver.base().log_action("Starting", service);
                driver_call(driver, policy, "start_service", move || driver.start_service(service))
                    .await?;
                true
            }
        };

        if run {
            notifier
                .emit(Notification::ServiceStarted {
                    service_name: service.service_name.clone(),
                    container_id: instance,
                })
                .await;
            if let Err(e) = driver.start_health_monitoring(service).await {
                warn!("Could not monitor service '{}': {}", service.service_name, e);
            }
        }
        Ok(())
    }

    /// Stop health monitoring, wait up to `grace` for in-flight operations
    /// (aborting the rest), then shut the driver down.
    ///
    /// Only the first call does anything.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!("Engine already shut down");
            return Ok(());
        }
        info!("Shutting down reconciliation engine");
        let _ = self.wake_tx.try_send(());

        let base = self.driver.base();
        base.health().stop_all().await;
        if !base.drain(grace).await {
            warn!("In-flight operations were aborted after {:?}", grace);
        }
        timeout(
            "driver shutdown",
            self.config.shutdown_timeout,
            self.driver.shutdown(),
        )
        .await
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}
