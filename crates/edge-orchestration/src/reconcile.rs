//! The reconciliation pass.
//!
//! One pass works from a single target snapshot and one observation of the
//! backend, in four phases:
//!
//! 1. services no longer in the target are stopped and removed;
//! 2. networks and volumes of every target app are ensured;
//! 3. services of every app are created, recreated or transitioned, in the
//!    order the app declares them;
//! 4. networks and volumes no app declares any more are removed.
//!
//! Removals run before creations so a replaced service never collides with
//! its predecessor's ports or volumes. Per-service failures are recorded and
//! reported in the result; only driver-level failures end the pass early.

use crate::{
    Error, Result,
    driver::Driver,
    events::Notification,
    model::{
        App, CurrentState, DesiredState, ReconciliationError, ReconciliationResult,
        ResourceError, Service, ServiceState, Settings,
    },
    resilience::{Retry, RetryConfig},
};
use futures::future::join_all;
use std::collections::HashSet;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Run one reconciliation pass against `driver`.
///
/// Fails with [`Error::ReconciliationInProgress`] when another pass holds
/// the driver's reconciliation lock, and with the underlying error when the
/// driver is not ready or the backend cannot be observed.
pub async fn reconcile<D: Driver + ?Sized>(driver: &D) -> Result<ReconciliationResult> {
    driver.base().ensure_ready()?;
    match driver
        .base()
        .reconcile_lock()
        .try_execute(|| run_pass(driver))
        .await
    {
        Some(result) => result,
        None => {
            debug!("Reconciliation pass already running; dropping request");
            Err(Error::ReconciliationInProgress)
        }
    }
}

async fn run_pass<D: Driver + ?Sized>(driver: &D) -> Result<ReconciliationResult> {
    let started = Instant::now();
    let target = driver.get_target_state().await;
    let current = driver.get_current_state().await?;
    let pass = Pass {
        driver,
        settings: &target.state.settings,
        stop_timeout: Duration::from_secs(target.state.settings.stop_timeout_secs),
    };
    let mut result = ReconciliationResult::new(target.version, driver.base().clock().now());
    let pass_id = Uuid::new_v4();

    info!(
        driver = %driver.base().name(),
        %pass_id,
        version = target.version,
        "Reconciling {} target apps against {} observed apps",
        target.state.apps.len(),
        current.apps.len()
    );

    // Removals
    let stale: Vec<&Service> = current
        .services()
        .filter(|s| target.state.service(&s.key()).is_none())
        .collect();
    let removals = join_all(stale.iter().map(|service| pass.remove(service))).await;
    for (service, outcome) in stale.into_iter().zip(removals) {
        match outcome {
            Ok(()) => result.services_removed += 1,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => result.errors.push(pass.fail(service, Some(service), "remove", e).await),
        }
    }

    // Resources, then services, one task per app
    let apps = join_all(
        target
            .state
            .apps
            .values()
            .map(|app| pass.converge_app(app, &current)),
    )
    .await;
    for outcome in apps {
        let tally = outcome?;
        result.services_created += tally.created;
        result.services_updated += tally.updated;
        result.services_skipped += tally.skipped;
        result.errors.extend(tally.errors);
        result.resource_errors.extend(tally.resource_errors);
    }

    // Orphaned resources
    for (app_id, app) in &current.apps {
        let declared = target.state.apps.get(app_id);
        for network in &app.networks {
            if declared.is_some_and(|a| a.networks.iter().any(|n| n.name == network.name)) {
                continue;
            }
            let name = network.name.as_str();
            match pass.call("remove_network", move || driver.remove_network(app_id, name)).await {
                Ok(()) => info!("Removed network '{}' of app {}", name, app_id),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => result
                    .resource_errors
                    .push(resource_error(app_id, "network", name, &e)),
            }
        }
        for volume in &app.volumes {
            if declared.is_some_and(|a| a.volumes.iter().any(|v| v.name == volume.name)) {
                continue;
            }
            let name = volume.name.as_str();
            match pass.call("remove_volume", move || driver.remove_volume(app_id, name)).await {
                Ok(()) => info!("Removed volume '{}' of app {}", name, app_id),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => result
                    .resource_errors
                    .push(resource_error(app_id, "volume", name, &e)),
            }
        }
    }

    result.duration_ms = started.elapsed().as_millis() as u64;
    result.timestamp = driver.base().clock().now();
    info!(
        driver = %driver.base().name(),
        %pass_id,
        version = result.target_version,
        created = result.services_created,
        updated = result.services_updated,
        removed = result.services_removed,
        skipped = result.services_skipped,
        errors = result.errors.len() + result.resource_errors.len(),
        "Reconciliation pass finished in {}ms",
        result.duration_ms
    );
    driver
        .base()
        .notifier()
        .emit(Notification::ReconciliationComplete {
            result: result.clone(),
        })
        .await;
    Ok(result)
}

/// Driver call needed to move an existing instance between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Start,
    Stop,
    Pause,
}

/// Minimal set of calls taking an instance from `observed` to `desired`
pub(crate) fn transitions(desired: DesiredState, observed: ServiceState) -> &'static [Transition] {
    use Transition::*;
    match (desired, observed) {
        (DesiredState::Running, ServiceState::Running | ServiceState::Creating) => &[],
        (DesiredState::Running, _) => &[Start],
        (DesiredState::Stopped, ServiceState::Running | ServiceState::Paused) => &[Stop],
        (DesiredState::Stopped, _) => &[],
        (DesiredState::Paused, ServiceState::Paused | ServiceState::Creating) => &[],
        (DesiredState::Paused, ServiceState::Running) => &[Pause],
        (DesiredState::Paused, _) => &[Start, Pause],
    }
}

enum Step {
    Created,
    Updated,
    Unchanged,
    Skipped,
}

#[derive(Default)]
struct Tally {
    created: u32,
    updated: u32,
    skipped: u32,
    errors: Vec<ReconciliationError>,
    resource_errors: Vec<ResourceError>,
}

struct Pass<'a, D: ?Sized> {
    driver: &'a D,
    settings: &'a Settings,
    stop_timeout: Duration,
}

impl<D: Driver + ?Sized> Pass<'_, D> {
    async fn call<T, F, Fut>(&self, operation: &str, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        driver_call(self.driver, &self.settings.retry, operation, call).await
    }

    /// Record a per-service failure and turn it into a result entry
    async fn fail(
        &self,
        service: &Service,
        observed: Option<&Service>,
        action: &str,
        error: Error,
    ) -> ReconciliationError {
        let base = self.driver.base();
        base.log_failure(action, service, &error);
        let recorded = base
            .errors()
            .record_failure(
                &service.key(),
                &error,
                observed.and_then(|o| o.status.as_ref()),
                &self.settings.error_backoff,
            )
            .await;
        base.notifier()
            .emit(Notification::ServiceError {
                service_name: service.service_name.clone(),
                error: recorded.clone(),
            })
            .await;
        ReconciliationError {
            service_name: service.service_name.clone(),
            app_id: service.app_id.clone(),
            error: recorded,
        }
    }

    async fn started(&self, service: &Service, instance_id: &str) {
        self.driver
            .base()
            .notifier()
            .emit(Notification::ServiceStarted {
                service_name: service.service_name.clone(),
                container_id: instance_id.to_string(),
            })
            .await;
    }

    async fn stopped(&self, service: &Service, instance_id: &str) {
        self.driver
            .base()
            .notifier()
            .emit(Notification::ServiceStopped {
                service_name: service.service_name.clone(),
                container_id: instance_id.to_string(),
                exit_code: service.status.as_ref().and_then(|s| s.exit_code),
            })
            .await;
    }

    /// Stop an observed instance if it runs, then remove it
    async fn retire(&self, observed: &Service) -> Result<()> {
        let driver = self.driver;
        driver.stop_health_monitoring(observed).await;
        if matches!(
            observed.observed_state(),
            ServiceState::Running | ServiceState::Paused
        ) {
            self.call("stop_service", move || driver.stop_service(observed, self.stop_timeout))
                .await?;
            self.stopped(observed, instance_of(observed)).await;
        }
        self.call("remove_service", move || driver.remove_service(observed, false))
            .await
    }

    /// Remove a service the target no longer lists
    async fn remove(&self, observed: &Service) -> Result<()> {
        let key = observed.key();
        let guard = self.driver.base().locks().lock(&key).await;
        self.retire(observed).await?;
        drop(guard);

        let base = self.driver.base();
        base.errors().forget(&key).await;
        base.locks().forget(&key).await;
        info!(
            "Removed service '{}' of app {}",
            observed.service_name, observed.app_id
        );
        Ok(())
    }

    /// Create an instance and bring it to its desired state.
    ///
    /// Only a failed create is an `Err`; once the instance exists, a failure
    /// to start or pause it comes back as `Ok(Some(error))`.
    async fn create(&self, desired: &Service) -> Result<Option<Error>> {
        let driver = self.driver;
        let instance_id = self
            .call("create_service", move || driver.create_service(desired))
            .await?;
        let settled = match desired.state {
            DesiredState::Running => {
                self.started(desired, &instance_id).await;
                Ok(())
            }
            DesiredState::Paused => {
                let mut created = desired.clone();
                created.instance_id = Some(instance_id);
                let created = &created;
                async {
                    self.call("start_service", move || driver.start_service(created)).await?;
                    self.call("pause_service", move || driver.pause_service(created)).await
                }
                .await
            }
            DesiredState::Stopped => Ok(()),
        };
        Ok(settled.err())
    }

    /// Ensure networks and volumes, then converge services in declared order
    async fn converge_app(&self, app: &App, current: &CurrentState) -> Result<Tally> {
        let mut tally = Tally::default();
        let observed_app = current.apps.get(&app.app_id);
        let mut unavailable: HashSet<&str> = HashSet::new();

        for network in &app.networks {
            let exists = observed_app.is_some_and(|a| a.networks.iter().any(|n| n.name == network.name));
            if exists {
                continue;
            }
            match self
                .call("create_network", move || self.driver.create_network(&app.app_id, network))
                .await
            {
                Ok(()) => info!("Created network '{}' of app {}", network.name, app.app_id),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Failed to create network '{}' of app {}: {}", network.name, app.app_id, e);
                    tally
                        .resource_errors
                        .push(resource_error(&app.app_id, "network", &network.name, &e));
                    unavailable.insert(network.name.as_str());
                }
            }
        }
        for volume in &app.volumes {
            let exists = observed_app.is_some_and(|a| a.volumes.iter().any(|v| v.name == volume.name));
            if exists {
                continue;
            }
            match self
                .call("create_volume", move || self.driver.create_volume(&app.app_id, volume))
                .await
            {
                Ok(()) => info!("Created volume '{}' of app {}", volume.name, app.app_id),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Failed to create volume '{}' of app {}: {}", volume.name, app.app_id, e);
                    tally
                        .resource_errors
                        .push(resource_error(&app.app_id, "volume", &volume.name, &e));
                    unavailable.insert(volume.name.as_str());
                }
            }
        }

        for desired in &app.services {
            let observed = current.service(&desired.key());
            match self.converge_service(desired, observed, &unavailable).await {
                Ok((step, unsettled)) => {
                    match step {
                        Step::Created => tally.created += 1,
                        Step::Updated => tally.updated += 1,
                        Step::Skipped => tally.skipped += 1,
                        Step::Unchanged => {}
                    }
                    if let Some(e) = unsettled {
                        if e.is_fatal() {
                            return Err(e);
                        }
                        tally.errors.push(self.fail(desired, observed, "settle", e).await);
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tally.errors.push(self.fail(desired, observed, "converge", e).await),
            }
        }
        Ok(tally)
    }

    async fn converge_service(
        &self,
        desired: &Service,
        observed: Option<&Service>,
        unavailable: &HashSet<&str>,
    ) -> Result<(Step, Option<Error>)> {
        let base = self.driver.base();
        let key = desired.key();
        let _guard = base.locks().lock(&key).await;

        if base.errors().in_cooldown(&key).await {
            debug!("Service {} is cooling down; skipping", key);
            return Ok((Step::Skipped, None));
        }

        let needs = desired
            .config
            .networks
            .iter()
            .map(String::as_str)
            .chain(
                desired
                    .config
                    .volumes
                    .iter()
                    .filter(|m| !m.is_bind())
                    .map(|m| m.source.as_str()),
            )
            .find(|name| unavailable.contains(name));
        if let Some(missing) = needs {
            return Err(Error::Backend(format!(
                "dependency '{}' of app {} is unavailable",
                missing, desired.app_id
            )));
        }

        let (step, unsettled) = match observed {
            None => {
                base.log_action("Creating", desired);
                (Step::Created, self.create(desired).await?)
            }
            Some(observed) if !desired.same_definition(observed) => {
                base.log_action("Recreating", desired);
                self.retire(observed).await?;
                (Step::Updated, self.create(desired).await?)
            }
            Some(observed) => {
                let steps = transitions(desired.state, observed.observed_state());
                for transition in steps {
                    self.apply(*transition, desired, observed).await?;
                }
                if steps.is_empty() {
                    (Step::Unchanged, None)
                } else {
                    (Step::Updated, None)
                }
            }
        };

        if desired.state == DesiredState::Running {
            if let Err(e) = self.driver.start_health_monitoring(desired).await {
                warn!("Could not monitor service '{}': {}", desired.service_name, e);
            }
        } else {
            self.driver.stop_health_monitoring(desired).await;
        }
        Ok((step, unsettled))
    }

    /// Drive the existing instance; drivers see the desired definition
    /// together with the observed status and instance id
    async fn apply(&self, transition: Transition, desired: &Service, observed: &Service) -> Result<()> {
        let driver = self.driver;
        let instance = instance_of(observed);
        let mut bound = desired.clone();
        bound.instance_id = observed.instance_id.clone();
        bound.status = observed.status.clone();
        let bound = &bound;
        match transition {
            Transition::Start => {
                driver.base().log_action("Starting", desired);
                self.call("start_service", move || driver.start_service(bound)).await?;
                if desired.state == DesiredState::Running {
                    self.started(desired, instance).await;
                }
            }
            Transition::Stop => {
                driver.base().log_action("Stopping", desired);
                driver.stop_health_monitoring(desired).await;
                self.call("stop_service", move || driver.stop_service(bound, self.stop_timeout))
                    .await?;
                self.stopped(observed, instance).await;
            }
            Transition::Pause => {
                driver.base().log_action("Pausing", desired);
                self.call("pause_service", move || driver.pause_service(bound)).await?;
            }
        }
        Ok(())
    }
}

/// Run a driver call with retries on transient errors, tracked for shutdown
pub(crate) async fn driver_call<D, T, F, Fut>(
    driver: &D,
    policy: &RetryConfig,
    operation: &str,
    call: F,
) -> Result<T>
where
    D: Driver + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let retry = Retry::new(policy.clone()).with_classifier(Error::is_retryable);
    driver
        .base()
        .track(operation, retry.execute(operation, call))
        .await
}

pub(crate) fn instance_of(service: &Service) -> &str {
    service.instance_id.as_deref().unwrap_or_default()
}

fn resource_error(app_id: &str, kind: &str, name: &str, error: &Error) -> ResourceError {
    ResourceError {
        resource: format!("{}:{}", kind, name),
        app_id: app_id.to_string(),
        message: error.to_string(),
    }
}
