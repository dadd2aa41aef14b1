//! # Edge orchestration
//!
//! Backend-agnostic core of the edge agent: a [`Driver`] contract with a
//! shared [`DriverBase`], the desired/observed state model, the
//! reconciliation algorithm, health and error state machines, and the
//! resilience primitives (retry with backoff, circuit breaker, single-flight
//! lock) the reconciliation loop is built from.
//!
//! Two real backends ship with the crate: [`DockerDriver`] for a standalone
//! container engine and [`KubernetesDriver`] for a lightweight Kubernetes
//! distribution. An in-memory backend is available behind the `test-utils`
//! feature.
//!
//! ## Example
//!
//! ```rust,no_run
//! use edge_orchestration::{
//!     App, DockerConfig, DockerDriver, DriverContext, EngineConfig, ReconciliationEngine,
//!     Service, TargetState,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> edge_orchestration::Result<()> {
//! let driver = Arc::new(DockerDriver::new(DockerConfig::default(), DriverContext::new()));
//! let engine = ReconciliationEngine::new(driver, EngineConfig::default());
//! engine.init().await?;
//!
//! let target = TargetState::default()
//!     .with_app(App::new("1", "web").with_service(Service::new("1", "10", "nginx", "nginx:1.27")));
//! engine.set_target_state(target).await?;
//! engine.reconcile_once().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod clock;
pub mod driver;
pub mod engine;
pub mod error;
pub mod events;
pub mod failures;
pub mod health;
pub mod health_monitor;
pub mod model;
pub mod reconcile;
pub mod resilience;
pub mod runtime;
pub mod target;

pub use clock::{Clock, SharedClock, SystemClock, system_clock};
#[cfg(any(test, feature = "test-utils"))]
pub use clock::ManualClock;
pub use driver::{
    CliRunner, CommandOutput, DockerConfig, DockerDriver, Driver, DriverBase, DriverContext,
    KubernetesConfig, KubernetesDriver, LogStream,
};
#[cfg(any(test, feature = "test-utils"))]
pub use driver::{DriverCall, MemoryDriver, MemoryOp};
pub use engine::{AppActionReport, EngineConfig, PassOutcome, ReconciliationEngine, SkipReason};
pub use error::{Error, Result};
pub use events::{Notification, Notifier};
pub use failures::ErrorTracker;
pub use health::{HealthStateMachine, ProbeOutcome, ProbeRunner};
pub use health_monitor::HealthMonitoringManager;
pub use model::{
    App, BackendKind, CurrentState, DesiredState, HealthState, LogLine, LogOptions, LogSource,
    Network, PortMapping, Probe, ProbeHandler, ProbeKind, Protocol, ReconciliationError,
    ReconciliationResult, ResourceError, ResourceLimits, Service, ServiceConfig, ServiceError,
    ServiceErrorKind, ServiceKey, ServiceMetrics, ServiceState, ServiceStatus, Settings,
    TargetState, Volume, VolumeMount,
};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, Retry, RetryConfig, SingleFlightLock};
pub use runtime::Spawner;
pub use target::{TargetStateHandle, VersionedTargetState};
