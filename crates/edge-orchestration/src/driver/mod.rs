//! The orchestration driver contract.
//!
//! Every backend implements [`Driver`]. Bookkeeping shared by all backends
//! (readiness, target-state storage, error tracking, health monitoring,
//! per-service critical sections and the reconciliation lock) lives in a
//! [`DriverBase`] that each driver owns and exposes through
//! [`Driver::base`]; the provided trait methods build on it.

pub mod base;
pub mod cli;
pub mod context;
pub mod docker;
#[cfg(all(test, unix))]
pub(crate) mod fake_cli;
pub mod kubernetes;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

pub use base::{DriverBase, ServiceLocks};
pub use cli::{CliRunner, CommandOutput};
pub use context::DriverContext;
pub use docker::{DockerConfig, DockerDriver};
pub use kubernetes::{KubernetesConfig, KubernetesDriver};
#[cfg(any(test, feature = "test-utils"))]
pub use memory::{DriverCall, MemoryDriver, MemoryOp};

use crate::{
    Result,
    health::ProbeOutcome,
    model::{
        CurrentState, DriverHealth, LogLine, LogOptions, Network, Probe, ReconciliationResult,
        Service, ServiceMetrics, ServiceState, ServiceStatus, TargetState, Volume,
    },
    target::VersionedTargetState,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Log stream from a service instance
pub type LogStream = futures::stream::BoxStream<'static, Result<LogLine>>;

/// A network or volume together with the app that owns it
pub type AppResource<T> = (String, T);

/// Backend contract for running services on one host
#[async_trait]
pub trait Driver: Send + Sync {
    /// Shared bookkeeping
    fn base(&self) -> &DriverBase;

    // Lifecycle

    /// Connect to the backend and verify it is reachable.
    ///
    /// Fails with [`crate::Error::BackendUnreachable`] when it is not.
    async fn init(&self) -> Result<()>;

    /// Release all resources; calling it again is a no-op
    async fn shutdown(&self) -> Result<()>;

    /// Whether `init` completed and `shutdown` has not run
    fn is_ready(&self) -> bool {
        self.base().is_ready()
    }

    /// Driver health report
    async fn get_health(&self) -> DriverHealth {
        self.base().health_report()
    }

    // State

    /// Observed state as reported by the backend
    async fn get_current_state(&self) -> Result<CurrentState> {
        self.base().ensure_ready()?;
        let services = self.list_services().await?;
        let networks = self.list_networks().await?;
        let volumes = self.list_volumes().await?;
        Ok(self
            .base()
            .assemble_current_state(services, networks, volumes)
            .await)
    }

    /// Validate and store a new target state, returning its version
    async fn set_target_state(&self, target: TargetState) -> Result<u64> {
        self.base().set_target_state(target).await
    }

    /// Active target snapshot
    async fn get_target_state(&self) -> Arc<VersionedTargetState> {
        self.base().target_state().await
    }

    /// Converge the backend towards the active target state
    async fn reconcile(&self) -> Result<ReconciliationResult> {
        crate::reconcile::reconcile(self).await
    }

    // Per-service operations

    /// Create an instance for `service` and return its instance id.
    ///
    /// The instance is started only when the service's desired state is
    /// running; otherwise it is left created but stopped.
    async fn create_service(&self, service: &Service) -> Result<String>;

    /// Start (or unpause) an existing instance
    async fn start_service(&self, service: &Service) -> Result<()>;

    /// Stop an instance, killing it after `timeout`
    async fn stop_service(&self, service: &Service, timeout: Duration) -> Result<()>;

    /// Remove an instance; `force` also removes running instances
    async fn remove_service(&self, service: &Service, force: bool) -> Result<()>;

    /// Restart an instance, killing it after `timeout`
    async fn restart_service(&self, service: &Service, timeout: Duration) -> Result<()>;

    /// Freeze an instance's processes
    async fn pause_service(&self, _service: &Service) -> Result<()> {
        Err(crate::Error::unsupported(self.base().name(), "pause_service"))
    }

    /// Runtime status of an instance
    async fn get_service_status(&self, service: &Service) -> Result<ServiceStatus>;

    /// All services managed by this agent, with observed fields filled in
    async fn list_services(&self) -> Result<Vec<Service>>;

    /// Run a command inside an instance
    async fn exec_in_service(&self, service: &Service, command: &[String]) -> Result<CommandOutput>;

    // Logs

    /// Log lines of an instance; infinite when `options.follow` is set
    async fn get_service_logs(&self, service: &Service, options: &LogOptions) -> Result<LogStream>;

    // Health

    /// Evaluate a single probe now
    async fn execute_health_check(&self, service: &Service, probe: &Probe) -> ProbeOutcome {
        self.base().health().execute_probe(service, probe).await
    }

    /// Start periodic probing of a service
    async fn start_health_monitoring(&self, service: &Service) -> Result<()> {
        self.base().health().start_monitoring(service).await
    }

    /// Stop periodic probing of a service
    async fn stop_health_monitoring(&self, service: &Service) {
        self.base().health().stop_monitoring(&service.key()).await
    }

    // Metrics

    /// Resource usage of one instance
    async fn get_service_metrics(&self, service: &Service) -> Result<ServiceMetrics>;

    /// Resource usage of every running instance.
    ///
    /// Instances whose sample fails are logged and left out.
    async fn get_all_metrics(&self) -> Result<Vec<ServiceMetrics>> {
        let services = self.list_services().await?;
        let mut metrics = Vec::new();
        for service in services
            .iter()
            .filter(|s| s.observed_state() == ServiceState::Running)
        {
            match self.get_service_metrics(service).await {
                Ok(sample) => metrics.push(sample),
                Err(e) => warn!(
                    "Failed to sample metrics for service '{}': {}",
                    service.service_name, e
                ),
            }
        }
        Ok(metrics)
    }

    // Networks and volumes

    /// Create an app network
    async fn create_network(&self, app_id: &str, network: &Network) -> Result<()>;

    /// Remove an app network
    async fn remove_network(&self, app_id: &str, name: &str) -> Result<()>;

    /// Networks managed by this agent
    async fn list_networks(&self) -> Result<Vec<AppResource<Network>>>;

    /// Create an app volume
    async fn create_volume(&self, app_id: &str, volume: &Volume) -> Result<()>;

    /// Remove an app volume
    async fn remove_volume(&self, app_id: &str, name: &str) -> Result<()>;

    /// Volumes managed by this agent
    async fn list_volumes(&self) -> Result<Vec<AppResource<Volume>>>;
}

/// Backend-side name of an app-scoped network or volume
pub fn scoped_name(app_id: &str, name: &str) -> String {
    format!("{}_{}", app_id, name)
}

/// Label keys marking backend objects owned by the agent
pub mod labels {
    /// Present on everything the agent manages
    pub const MANAGED: &str = "io.edge.managed";
    /// Owning app id
    pub const APP_ID: &str = "io.edge.app-id";
    /// Owning app name
    pub const APP_NAME: &str = "io.edge.app-name";
    /// Service id
    pub const SERVICE_ID: &str = "io.edge.service-id";
    /// Service name
    pub const SERVICE_NAME: &str = "io.edge.service-name";
    /// JSON of the service configuration the instance was created from
    pub const SERVICE_CONFIG: &str = "io.edge.service-config";
    /// Image reference as written in the target state
    pub const IMAGE: &str = "io.edge.image";
    /// Unscoped network name
    pub const NETWORK_NAME: &str = "io.edge.network-name";
    /// Unscoped volume name
    pub const VOLUME_NAME: &str = "io.edge.volume-name";
}

/// Observed desired-state equivalent of an observed lifecycle state
pub(crate) fn desired_from_observed(state: ServiceState) -> crate::model::DesiredState {
    use crate::model::DesiredState;
    match state {
        ServiceState::Running | ServiceState::Creating => DesiredState::Running,
        ServiceState::Paused => DesiredState::Paused,
        _ => DesiredState::Stopped,
    }
}
