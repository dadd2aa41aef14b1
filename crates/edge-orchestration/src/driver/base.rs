//! Bookkeeping shared by every driver.

use super::{AppResource, DriverContext};
use crate::{
    Error, Result,
    clock::SharedClock,
    events::Notifier,
    failures::ErrorTracker,
    health::ProbeRunner,
    health_monitor::HealthMonitoringManager,
    model::{
        App, CurrentState, DriverHealth, HealthState, Network, Service, ServiceKey, ServiceState,
        TargetState, Volume,
    },
    resilience::SingleFlightLock,
    runtime::{Spawner, sleep},
    target::{TargetStateHandle, VersionedTargetState},
};
use futures::future::{AbortHandle, Abortable};
use futures::lock::{Mutex, OwnedMutexGuard};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Per-service critical sections.
///
/// Two operations on the same service never overlap; operations on
/// different services proceed independently.
#[derive(Default)]
pub struct ServiceLocks {
    locks: Mutex<HashMap<ServiceKey, Arc<Mutex<()>>>>,
}

impl ServiceLocks {
    /// Wait for exclusive access to a service
    pub async fn lock(&self, key: &ServiceKey) -> OwnedMutexGuard<()> {
        let lock = self.locks.lock().await.entry(key.clone()).or_default().clone();
        lock.lock_owned().await
    }

    /// Drop the lock of a removed service unless someone still holds it
    pub async fn forget(&self, key: &ServiceKey) {
        let mut locks = self.locks.lock().await;
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }
}

#[derive(Default)]
struct InFlight {
    next_id: AtomicU64,
    operations: std::sync::Mutex<HashMap<u64, (String, AbortHandle)>>,
}

impl InFlight {
    fn register(&self, operation: &str, handle: AbortHandle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, (operation.to_string(), handle));
        id
    }

    fn finish(&self, id: u64) {
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn len(&self) -> usize {
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn abort_all(&self) -> Vec<String> {
        let operations = self.operations.lock().unwrap_or_else(PoisonError::into_inner);
        operations
            .values()
            .map(|(name, handle)| {
                handle.abort();
                name.clone()
            })
            .collect()
    }
}

struct Finish<'a> {
    in_flight: &'a InFlight,
    id: u64,
}

impl Drop for Finish<'_> {
    fn drop(&mut self) {
        self.in_flight.finish(self.id);
    }
}

/// State and helpers common to all drivers
pub struct DriverBase {
    name: String,
    ready: AtomicBool,
    shut_down: AtomicBool,
    context: DriverContext,
    target: TargetStateHandle,
    errors: ErrorTracker,
    health: HealthMonitoringManager,
    locks: ServiceLocks,
    in_flight: InFlight,
    reconcile_lock: SingleFlightLock,
}

impl DriverBase {
    /// Create the base for a driver called `name`
    pub fn new(name: impl Into<String>, runner: Arc<dyn ProbeRunner>, context: DriverContext) -> Self {
        let health = HealthMonitoringManager::new(
            runner,
            context.spawner.clone(),
            context.notifier.clone(),
        );
        let errors = ErrorTracker::new(context.clock.clone());
        Self {
            name: name.into(),
            ready: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            context,
            target: TargetStateHandle::new(),
            errors,
            health,
            locks: ServiceLocks::default(),
            in_flight: InFlight::default(),
            reconcile_lock: SingleFlightLock::new(),
        }
    }

    /// Driver name used in logs and errors
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the driver finished init and has not shut down
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.is_shut_down()
    }

    /// Whether shutdown has started
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Mark init as completed
    pub fn mark_ready(&self) {
        if !self.ready.swap(true, Ordering::SeqCst) {
            info!(driver = %self.name, "Driver ready");
        }
    }

    /// Fail unless the driver may accept operations
    pub fn ensure_ready(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }
        if !self.ready.load(Ordering::SeqCst) {
            return Err(Error::NotReady(format!("{} driver has not been initialized", self.name)));
        }
        Ok(())
    }

    /// Default health report derived from readiness
    pub fn health_report(&self) -> DriverHealth {
        let message = if self.is_shut_down() {
            Some("driver has been shut down".to_string())
        } else if !self.is_ready() {
            Some("driver has not been initialized".to_string())
        } else {
            None
        };
        DriverHealth {
            driver: self.name.clone(),
            healthy: message.is_none(),
            message,
            checked_at: self.context.clock.now(),
        }
    }

    /// Time source
    pub fn clock(&self) -> &SharedClock {
        &self.context.clock
    }

    /// Notification fan-out
    pub fn notifier(&self) -> &Notifier {
        &self.context.notifier
    }

    /// Background task spawner
    pub fn spawner(&self) -> &Arc<dyn Spawner> {
        &self.context.spawner
    }

    /// Per-service error tracking
    pub fn errors(&self) -> &ErrorTracker {
        &self.errors
    }

    /// Health monitors
    pub fn health(&self) -> &HealthMonitoringManager {
        &self.health
    }

    /// Per-service critical sections
    pub fn locks(&self) -> &ServiceLocks {
        &self.locks
    }

    /// Lock guarding reconciliation passes
    pub fn reconcile_lock(&self) -> &SingleFlightLock {
        &self.reconcile_lock
    }

    /// Validate and store a new target snapshot
    pub async fn set_target_state(&self, target: TargetState) -> Result<u64> {
        match self.target.replace(target).await {
            Ok(version) => {
                info!(driver = %self.name, version, "Accepted target state");
                Ok(version)
            }
            Err(e) => {
                warn!(driver = %self.name, "Rejected target state: {}", e);
                Err(e)
            }
        }
    }

    /// Active target snapshot
    pub async fn target_state(&self) -> Arc<VersionedTargetState> {
        self.target.snapshot().await
    }

    /// Run a per-service operation so shutdown can wait for it or abort it
    pub async fn track<T, F>(&self, operation: &str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }
        let (handle, registration) = AbortHandle::new_pair();
        let id = self.in_flight.register(operation, handle);
        let _finish = Finish {
            in_flight: &self.in_flight,
            id,
        };

        match Abortable::new(future, registration).await {
            Ok(result) => result,
            Err(_) => {
                warn!(driver = %self.name, "Operation '{}' aborted by shutdown", operation);
                Err(Error::ShutDown)
            }
        }
    }

    /// Number of tracked operations still running
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Wait for tracked operations to finish; abort the rest after `timeout`.
    ///
    /// Returns false if anything had to be aborted.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.in_flight.len() == 0 {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                let aborted = self.in_flight.abort_all();
                warn!(
                    driver = %self.name,
                    "Aborting {} in-flight operations: {}",
                    aborted.len(),
                    aborted.join(", ")
                );
                return false;
            }
            sleep((deadline - now).min(Duration::from_millis(25))).await;
        }
    }

    /// Shared part of driver shutdown; returns false if it already ran
    pub async fn shutdown(&self) -> bool {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            debug!(driver = %self.name, "Shutdown already performed");
            return false;
        }
        info!(driver = %self.name, "Shutting down driver");
        self.health.stop_all().await;
        self.drain(self.context.shutdown_grace).await;
        self.ready.store(false, Ordering::SeqCst);
        true
    }

    /// Health to report for an observed service
    pub async fn observed_health(&self, service: &Service) -> HealthState {
        let reported = service.status.as_ref().map(|s| s.health).unwrap_or_default();
        if service.observed_state() != ServiceState::Running {
            return HealthState::Unknown;
        }
        if let Some(monitored) = self.health.health(&service.key()).await {
            return monitored;
        }
        if reported != HealthState::Unknown {
            return reported;
        }
        if service.config.has_probes() {
            HealthState::Starting
        } else {
            HealthState::Healthy
        }
    }

    /// Group observed services and resources into a [`CurrentState`].
    ///
    /// Health comes from the monitors and errors from the tracker. A service
    /// seen running and healthy has its tracked error cleared.
    pub async fn assemble_current_state(
        &self,
        services: Vec<Service>,
        networks: Vec<AppResource<Network>>,
        volumes: Vec<AppResource<Volume>>,
    ) -> CurrentState {
        let mut apps: BTreeMap<String, App> = BTreeMap::new();

        for mut service in services {
            let key = service.key();
            let health = self.observed_health(&service).await;
            if let Some(status) = service.status.as_mut() {
                status.health = health;
                self.errors.observe(&key, status).await;
            }
            // Tracked errors win over backend-reported ones
            if let Some(tracked) = self.errors.get(&key).await {
                service.error = Some(tracked);
            }
            apps.entry(service.app_id.clone())
                .or_insert_with(|| App::new(&service.app_id, &service.app_name))
                .services
                .push(service);
        }
        for (app_id, network) in networks {
            apps.entry(app_id.clone())
                .or_insert_with(|| App::new(app_id, ""))
                .networks
                .push(network);
        }
        for (app_id, volume) in volumes {
            apps.entry(app_id.clone())
                .or_insert_with(|| App::new(app_id, ""))
                .volumes
                .push(volume);
        }

        CurrentState {
            apps,
            captured_at: self.context.clock.now(),
        }
    }

    /// Log a service action with the driver and service identity
    pub fn log_action(&self, action: &str, service: &Service) {
        info!(
            driver = %self.name,
            app_id = %service.app_id,
            service_id = %service.service_id,
            "{} service '{}'",
            action,
            service.service_name
        );
    }

    /// Log a failed service action with the driver and service identity
    pub fn log_failure(&self, action: &str, service: &Service, error: &Error) {
        warn!(
            driver = %self.name,
            app_id = %service.app_id,
            service_id = %service.service_id,
            "Failed to {} service '{}': {}",
            action,
            service.service_name,
            error
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ProbeOutcome;
    use crate::model::{Probe, ProbeHandler, ServiceConfig, ServiceStatus};
    use crate::runtime::ThreadSpawner;
    use async_trait::async_trait;

    struct Healthy;

    #[async_trait]
    impl ProbeRunner for Healthy {
        async fn run_probe(&self, _service: &Service, _probe: &Probe) -> ProbeOutcome {
            ProbeOutcome::Success
        }
    }

    fn base(grace: Duration) -> DriverBase {
        let context = DriverContext::new()
            .with_spawner(Arc::new(ThreadSpawner))
            .with_shutdown_grace(grace);
        DriverBase::new("test", Arc::new(Healthy), context)
    }

    #[test]
    fn test_readiness_lifecycle() {
        futures::executor::block_on(async {
            let base = base(Duration::from_millis(50));
            assert!(matches!(base.ensure_ready(), Err(Error::NotReady(_))));
            assert!(!base.health_report().healthy);

            base.mark_ready();
            assert!(base.ensure_ready().is_ok());
            assert!(base.health_report().healthy);

            assert!(base.shutdown().await);
            assert!(!base.shutdown().await);
            assert!(matches!(base.ensure_ready(), Err(Error::ShutDown)));
            assert!(!base.is_ready());
        });
    }

    #[test]
    fn test_drain_aborts_stuck_operations() {
        futures::executor::block_on(async {
            let base = base(Duration::from_millis(20));
            base.mark_ready();

            let stuck = base.track("stuck", async {
                sleep(Duration::from_secs(30)).await;
                Ok(())
            });
            let shutdown = async {
                // Let the operation register first
                sleep(Duration::from_millis(5)).await;
                assert_eq!(base.in_flight(), 1);
                base.drain(Duration::from_millis(20)).await
            };
            let (result, drained) = futures::join!(stuck, shutdown);

            assert!(!drained);
            assert!(matches!(result, Err(Error::ShutDown)));
            assert_eq!(base.in_flight(), 0);
        });
    }

    #[test]
    fn test_track_rejects_after_shutdown() {
        futures::executor::block_on(async {
            let base = base(Duration::from_millis(10));
            base.mark_ready();
            assert_eq!(base.track("quick", async { Ok(5) }).await.unwrap(), 5);
            base.shutdown().await;
            let result = base.track("late", async { Ok(()) }).await;
            assert!(matches!(result, Err(Error::ShutDown)));
        });
    }

    #[test]
    fn test_service_locks_serialize_same_key() {
        futures::executor::block_on(async {
            let locks = ServiceLocks::default();
            let key = ServiceKey {
                app_id: "1".into(),
                service_id: "10".into(),
            };
            let held = locks.lock(&key).await;
            assert!(locks.locks.lock().await[&key].try_lock().is_none());

            let other = ServiceKey {
                app_id: "1".into(),
                service_id: "11".into(),
            };
            let _independent = locks.lock(&other).await;

            drop(held);
            locks.forget(&key).await;
            assert!(!locks.locks.lock().await.contains_key(&key));
        });
    }

    #[test]
    fn test_current_state_health_overlay() {
        futures::executor::block_on(async {
            let base = base(Duration::from_millis(10));

            let mut plain = Service::new("1", "10", "plain", "plain:1");
            plain.status = Some(ServiceStatus::new(ServiceState::Running));

            let mut probed = Service::new("1", "11", "probed", "probed:1").with_config(ServiceConfig {
                readiness_probe: Some(Probe::new(ProbeHandler::Tcp { port: 80 })),
                ..ServiceConfig::default()
            });
            probed.status = Some(ServiceStatus::new(ServiceState::Running));

            let mut stopped = Service::new("2", "20", "idle", "idle:1");
            stopped.status = Some(ServiceStatus::new(ServiceState::Stopped));

            let state = base
                .assemble_current_state(
                    vec![plain, probed, stopped],
                    vec![("1".to_string(), Network::new("frontend"))],
                    Vec::new(),
                )
                .await;

            let app = &state.apps["1"];
            assert_eq!(app.networks.len(), 1);
            let health = |id: &str| app.service(id).unwrap().status.as_ref().unwrap().health;
            assert_eq!(health("10"), HealthState::Healthy);
            assert_eq!(health("11"), HealthState::Starting);
            assert_eq!(
                state.apps["2"].services[0].status.as_ref().unwrap().health,
                HealthState::Unknown
            );
        });
    }
}
