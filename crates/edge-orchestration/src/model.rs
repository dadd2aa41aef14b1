//! Desired and observed state model.
//!
//! A [`TargetState`] is authored elsewhere and handed to the engine whole; a
//! [`CurrentState`] is always derived from what the active driver reports.
//! Both group [`Service`]s into [`App`]s keyed by app id.

use crate::resilience::{CircuitBreakerConfig, RetryConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a service across target and current state
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceKey {
    /// Owning app
    pub app_id: String,
    /// Service id within the app
    pub service_id: String,
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app_id, self.service_id)
    }
}

/// Lifecycle state requested for a service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    /// Service should be running
    #[default]
    Running,
    /// Service should exist but not run
    Stopped,
    /// Service should exist with its processes frozen
    Paused,
}

/// Transport protocol of a port mapping
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP
    #[default]
    Tcp,
    /// UDP
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Host-to-container port mapping
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port published on the host
    pub host_port: u16,
    /// Port inside the workload
    pub container_port: u16,
    /// Protocol
    #[serde(default)]
    pub protocol: Protocol,
}

/// Volume or bind mount
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeMount {
    /// App volume name, or an absolute host path for bind mounts
    pub source: String,
    /// Mount point inside the workload
    pub target: String,
    /// Mount read-only
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeMount {
    /// Whether the source is a host path rather than a named volume
    pub fn is_bind(&self) -> bool {
        self.source.starts_with('/')
    }
}

/// Resource limits applied to a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// CPU limit in thousandths of a core
    pub cpu_millis: Option<u64>,
    /// Memory limit in bytes
    pub memory_bytes: Option<u64>,
}

impl ResourceLimits {
    /// Whether no limit is set
    pub fn is_empty(&self) -> bool {
        self.cpu_millis.is_none() && self.memory_bytes.is_none()
    }
}

/// How a probe checks the workload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProbeHandler {
    /// HTTP GET; status 200-399 passes
    Http {
        /// Request path
        #[serde(default = "default_http_path")]
        path: String,
        /// Container port
        port: u16,
    },
    /// TCP connect
    Tcp {
        /// Container port
        port: u16,
    },
    /// Command inside the workload; exit status 0 passes
    Exec {
        /// Command and arguments
        command: Vec<String>,
    },
}

fn default_http_path() -> String {
    "/".to_string()
}

/// Health probe definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Probe {
    /// Check mechanism
    #[serde(flatten)]
    pub handler: ProbeHandler,
    /// Delay before the first evaluation
    #[serde(default)]
    pub initial_delay_seconds: u64,
    /// Interval between evaluations
    #[serde(default = "default_period")]
    pub period_seconds: u64,
    /// Per-evaluation deadline
    #[serde(default = "default_probe_timeout")]
    pub timeout_seconds: u64,
    /// Consecutive passes needed to become healthy
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Consecutive failures needed to become unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_period() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    1
}

fn default_success_threshold() -> u32 {
    1
}

fn default_failure_threshold() -> u32 {
    3
}

impl Probe {
    /// Probe with default timings
    pub fn new(handler: ProbeHandler) -> Self {
        Self {
            handler,
            initial_delay_seconds: 0,
            period_seconds: default_period(),
            timeout_seconds: default_probe_timeout(),
            success_threshold: default_success_threshold(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// Which probe slot a definition occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// Restart-worthy liveness
    Liveness,
    /// Traffic readiness
    Readiness,
    /// Gates the others until it first passes
    Startup,
}

/// Everything about a service that forces a recreate when it changes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Command override
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Environment variables
    pub environment: BTreeMap<String, String>,
    /// Published ports
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortMapping>,
    /// Volume and bind mounts
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeMount>,
    /// App networks the service joins
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<String>,
    /// Resource limits
    #[serde(skip_serializing_if = "ResourceLimits::is_empty")]
    pub resources: ResourceLimits,
    /// User labels
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Liveness probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liveness_probe: Option<Probe>,
    /// Readiness probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<Probe>,
    /// Startup probe
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_probe: Option<Probe>,
}

impl ServiceConfig {
    /// Configured probes with their slots
    pub fn probes(&self) -> Vec<(ProbeKind, &Probe)> {
        [
            (ProbeKind::Startup, self.startup_probe.as_ref()),
            (ProbeKind::Liveness, self.liveness_probe.as_ref()),
            (ProbeKind::Readiness, self.readiness_probe.as_ref()),
        ]
        .into_iter()
        .filter_map(|(kind, probe)| probe.map(|p| (kind, p)))
        .collect()
    }

    /// Whether any probe is configured
    pub fn has_probes(&self) -> bool {
        self.liveness_probe.is_some() || self.readiness_probe.is_some() || self.startup_probe.is_some()
    }
}

/// One workload unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    /// Stable id; never changes once the engine knows the service
    pub service_id: String,
    /// Name, unique within the app
    pub service_name: String,
    /// Owning app id
    pub app_id: String,
    /// Owning app name
    #[serde(default)]
    pub app_name: String,
    /// Image reference
    pub image: String,
    /// Requested lifecycle state
    #[serde(default)]
    pub state: DesiredState,
    /// Configuration bag
    #[serde(default)]
    pub config: ServiceConfig,
    /// Backend-assigned instance id (observed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Runtime status (observed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ServiceStatus>,
    /// Last operational error (observed)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ServiceError>,
}

impl Service {
    /// Create a running service with an empty configuration
    pub fn new(
        app_id: impl Into<String>,
        service_id: impl Into<String>,
        service_name: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            service_id: service_id.into(),
            service_name: service_name.into(),
            app_id: app_id.into(),
            app_name: String::new(),
            image: image.into(),
            state: DesiredState::Running,
            config: ServiceConfig::default(),
            instance_id: None,
            status: None,
            error: None,
        }
    }

    /// Set the requested lifecycle state
    pub fn with_state(mut self, state: DesiredState) -> Self {
        self.state = state;
        self
    }

    /// Set the configuration bag
    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    /// Identity key
    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            app_id: self.app_id.clone(),
            service_id: self.service_id.clone(),
        }
    }

    /// Whether two descriptions would produce the same workload
    pub fn same_definition(&self, other: &Service) -> bool {
        self.service_id == other.service_id
            && self.service_name == other.service_name
            && self.image == other.image
            && self.config == other.config
    }

    /// Observed lifecycle state, `Unknown` when nothing was reported
    pub fn observed_state(&self) -> ServiceState {
        self.status.as_ref().map(|s| s.state).unwrap_or(ServiceState::Unknown)
    }
}

/// Network shared by services of an app
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Name, unique within the app
    pub name: String,
    /// Backend network driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Network {
    /// Network with the default driver
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: None,
            labels: BTreeMap::new(),
        }
    }
}

/// Volume shared by services of an app
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Name, unique within the app
    pub name: String,
    /// Backend volume driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Volume {
    /// Volume with the default driver
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: None,
            labels: BTreeMap::new(),
        }
    }
}

/// Named group of services plus the networks and volumes they share
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    /// App id
    pub app_id: String,
    /// App name
    #[serde(default)]
    pub app_name: String,
    /// Services in declaration order
    #[serde(default)]
    pub services: Vec<Service>,
    /// Networks
    #[serde(default)]
    pub networks: Vec<Network>,
    /// Volumes
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

impl App {
    /// Empty app
    pub fn new(app_id: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            app_name: app_name.into(),
            services: Vec::new(),
            networks: Vec::new(),
            volumes: Vec::new(),
        }
    }

    /// Add a service, filling in the owning app fields
    pub fn with_service(mut self, mut service: Service) -> Self {
        service.app_id = self.app_id.clone();
        service.app_name = self.app_name.clone();
        self.services.push(service);
        self
    }

    /// Add a network
    pub fn with_network(mut self, network: Network) -> Self {
        self.networks.push(network);
        self
    }

    /// Add a volume
    pub fn with_volume(mut self, volume: Volume) -> Self {
        self.volumes.push(volume);
        self
    }

    /// Find a service by id
    pub fn service(&self, service_id: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.service_id == service_id)
    }
}

/// Orchestration backend installed on the host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Standalone container engine
    #[default]
    Docker,
    /// Lightweight Kubernetes distribution
    K3s,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Docker => write!(f, "docker"),
            BackendKind::K3s => write!(f, "k3s"),
        }
    }
}

/// Global settings carried by the target state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Backend the agent should drive
    pub backend: BackendKind,
    /// Interval between reconciliation passes
    pub poll_interval_ms: u64,
    /// Interval between state reports
    pub report_interval_ms: u64,
    /// Grace period for stop/restart
    pub stop_timeout_secs: u64,
    /// In-pass retry policy for transient driver errors
    pub retry: RetryConfig,
    /// Cooldown policy for services whose operations keep failing.
    ///
    /// Only the delay fields apply. A failing service is retried forever,
    /// once per pass after its cooldown lapses, with cooldowns growing up to
    /// `max_delay_ms`; `max_attempts` is ignored and defaults to `u32::MAX`.
    pub error_backoff: RetryConfig,
    /// Breaker for passes that fail at the driver level
    pub circuit_breaker: CircuitBreakerConfig,
    /// Feature flags
    pub feature_flags: BTreeMap<String, bool>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Docker,
            poll_interval_ms: 60_000,
            report_interval_ms: 10_000,
            stop_timeout_secs: 10,
            retry: RetryConfig::default(),
            // No attempt limit: failing services keep being retried
            error_backoff: RetryConfig {
                max_attempts: u32::MAX,
                ..RetryConfig::default()
            },
            circuit_breaker: CircuitBreakerConfig::default(),
            feature_flags: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Whether a feature flag is set
    pub fn feature_enabled(&self, flag: &str) -> bool {
        self.feature_flags.get(flag).copied().unwrap_or(false)
    }
}

/// Desired-state snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    /// Apps by id
    #[serde(default)]
    pub apps: BTreeMap<String, App>,
    /// Global settings
    #[serde(default)]
    pub settings: Settings,
}

impl TargetState {
    /// Add or replace an app
    pub fn with_app(mut self, app: App) -> Self {
        self.apps.insert(app.app_id.clone(), app);
        self
    }

    /// Look up a service
    pub fn service(&self, key: &ServiceKey) -> Option<&Service> {
        self.apps.get(&key.app_id)?.service(&key.service_id)
    }
}

/// Observed-state snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentState {
    /// Apps by id
    pub apps: BTreeMap<String, App>,
    /// When the snapshot was taken
    pub captured_at: DateTime<Utc>,
}

impl CurrentState {
    /// Empty snapshot
    pub fn empty(captured_at: DateTime<Utc>) -> Self {
        Self {
            apps: BTreeMap::new(),
            captured_at,
        }
    }

    /// Look up a service
    pub fn service(&self, key: &ServiceKey) -> Option<&Service> {
        self.apps.get(&key.app_id)?.service(&key.service_id)
    }

    /// All services across apps
    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.apps.values().flat_map(|app| app.services.iter())
    }
}

/// Observed lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Instance is being created
    Creating,
    /// Instance is running
    Running,
    /// Instance processes are frozen
    Paused,
    /// Instance exists but is not running
    Stopped,
    /// Instance failed
    Error,
    /// Nothing reliable is known
    #[default]
    Unknown,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Creating => "creating",
            ServiceState::Running => "running",
            ServiceState::Paused => "paused",
            ServiceState::Stopped => "stopped",
            ServiceState::Error => "error",
            ServiceState::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Aggregated probe health
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Probes pass
    Healthy,
    /// Probes fail
    Unhealthy,
    /// Waiting for enough evaluations
    Starting,
    /// Not monitored
    #[default]
    Unknown,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Starting => "starting",
            HealthState::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Runtime status reported by a driver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Lifecycle state
    pub state: ServiceState,
    /// Last start time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Last exit time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Last exit code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    /// Restarts performed by the backend
    #[serde(default)]
    pub restart_count: u32,
    /// Probe health
    #[serde(default)]
    pub health: HealthState,
}

impl ServiceStatus {
    /// Status with only the lifecycle state set
    pub fn new(state: ServiceState) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }

    /// Running and passing probes
    pub fn is_running_healthy(&self) -> bool {
        self.state == ServiceState::Running && self.health == HealthState::Healthy
    }
}

/// Failure classification of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceErrorKind {
    /// Image pulls keep failing; waiting before the next pull
    ImagePullBackOff,
    /// The last image pull failed
    ErrImagePull,
    /// The instance could not be started
    StartFailure,
    /// The instance keeps crashing after start
    CrashLoopBackOff,
    /// Anything else
    Unknown,
}

impl fmt::Display for ServiceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceErrorKind::ImagePullBackOff => "ImagePullBackOff",
            ServiceErrorKind::ErrImagePull => "ErrImagePull",
            ServiceErrorKind::StartFailure => "StartFailure",
            ServiceErrorKind::CrashLoopBackOff => "CrashLoopBackOff",
            ServiceErrorKind::Unknown => "Unknown",
        };
        write!(f, "{s}")
    }
}

/// Classified operational failure of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceError {
    /// Classification
    pub kind: ServiceErrorKind,
    /// Backend message
    pub message: String,
    /// When the failure happened
    pub timestamp: DateTime<Utc>,
    /// Failed attempts so far
    pub retry_count: u32,
    /// Earliest time the next attempt may run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry: Option<DateTime<Utc>>,
}

/// Per-service failure inside a reconciliation result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationError {
    /// Service name
    pub service_name: String,
    /// Owning app id
    pub app_id: String,
    /// Classified error
    pub error: ServiceError,
}

/// Failure on a network or volume inside a reconciliation result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceError {
    /// Resource description such as `network:frontend`
    pub resource: String,
    /// Owning app id
    pub app_id: String,
    /// Backend message
    pub message: String,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    /// The pass itself completed; per-service failures do not clear this
    pub success: bool,
    /// Services created
    pub services_created: u32,
    /// Services recreated or transitioned
    pub services_updated: u32,
    /// Services removed
    pub services_removed: u32,
    /// Services left alone because they are cooling down
    pub services_skipped: u32,
    /// Per-service failures
    pub errors: Vec<ReconciliationError>,
    /// Network and volume failures
    pub resource_errors: Vec<ResourceError>,
    /// Version of the target snapshot the pass worked from
    pub target_version: u64,
    /// Wall time spent
    pub duration_ms: u64,
    /// When the pass finished
    pub timestamp: DateTime<Utc>,
}

impl ReconciliationResult {
    /// Empty successful result
    pub fn new(target_version: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            success: true,
            services_created: 0,
            services_updated: 0,
            services_removed: 0,
            services_skipped: 0,
            errors: Vec::new(),
            resource_errors: Vec::new(),
            target_version,
            duration_ms: 0,
            timestamp,
        }
    }

    /// Whether the pass changed nothing and hit no errors
    pub fn is_noop(&self) -> bool {
        self.services_created == 0
            && self.services_updated == 0
            && self.services_removed == 0
            && self.errors.is_empty()
            && self.resource_errors.is_empty()
    }
}

/// Options for reading service logs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    /// Keep the stream open for new lines
    pub follow: bool,
    /// Only the last N lines
    pub tail: Option<usize>,
    /// Only lines after this time
    pub since: Option<DateTime<Utc>>,
    /// Ask the backend for timestamps
    pub timestamps: bool,
    /// Include stdout
    pub stdout: bool,
    /// Include stderr
    pub stderr: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            follow: false,
            tail: None,
            since: None,
            timestamps: false,
            stdout: true,
            stderr: true,
        }
    }
}

/// Output stream a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// A single log line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// Source stream
    pub source: LogSource,
    /// Line content without trailing newline
    pub message: String,
    /// Backend timestamp, when requested and parseable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Resource usage sample of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceMetrics {
    /// Owning app id
    pub app_id: String,
    /// Service name
    pub service_name: String,
    /// CPU usage in percent of one core
    pub cpu_percent: f64,
    /// Memory in use
    pub memory_usage_bytes: u64,
    /// Memory limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<u64>,
    /// Bytes received
    pub network_rx_bytes: u64,
    /// Bytes sent
    pub network_tx_bytes: u64,
    /// Sample time
    pub timestamp: DateTime<Utc>,
}

/// Health of the driver itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverHealth {
    /// Driver name
    pub driver: String,
    /// Backend reachable and driver ready
    pub healthy: bool,
    /// Extra detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the check ran
    pub checked_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET_YAML: &str = r#"
apps:
  "1":
    app_id: "1"
    app_name: web
    networks:
      - name: frontend
    volumes:
      - name: data
    services:
      - service_id: "10"
        service_name: nginx
        app_id: "1"
        image: nginx:1.27
        config:
          environment:
            MODE: prod
          ports:
            - host_port: 8080
              container_port: 80
          volumes:
            - source: data
              target: /usr/share/nginx/html
          networks: [frontend]
          liveness_probe:
            type: http
            path: /healthz
            port: 80
            period_seconds: 5
      - service_id: "11"
        service_name: worker
        app_id: "1"
        image: worker:2
        state: stopped
settings:
  backend: k3s
  poll_interval_ms: 5000
  feature_flags:
    fast_pull: true
"#;

    #[test]
    fn test_target_state_yaml_defaults() {
        let target: TargetState = serde_yaml::from_str(TARGET_YAML).unwrap();
        let app = &target.apps["1"];
        assert_eq!(app.services.len(), 2);
        assert_eq!(app.services[0].state, DesiredState::Running);
        assert_eq!(app.services[1].state, DesiredState::Stopped);

        let probe = app.services[0].config.liveness_probe.as_ref().unwrap();
        assert_eq!(
            probe.handler,
            ProbeHandler::Http {
                path: "/healthz".into(),
                port: 80
            }
        );
        assert_eq!(probe.period_seconds, 5);
        assert_eq!(probe.failure_threshold, 3);
        assert_eq!(app.services[0].config.ports[0].protocol, Protocol::Tcp);

        assert_eq!(target.settings.backend, BackendKind::K3s);
        assert_eq!(target.settings.poll_interval_ms, 5000);
        assert_eq!(target.settings.stop_timeout_secs, 10);
        assert!(target.settings.feature_enabled("fast_pull"));
        assert!(!target.settings.feature_enabled("missing"));
    }

    #[test]
    fn test_same_definition_ignores_observed_fields() {
        let desired = Service::new("1", "10", "nginx", "nginx:1.27");
        let mut observed = desired.clone();
        observed.instance_id = Some("abc".into());
        observed.status = Some(ServiceStatus::new(ServiceState::Stopped));
        observed.state = DesiredState::Stopped;
        assert!(desired.same_definition(&observed));

        observed.image = "nginx:1.28".into();
        assert!(!desired.same_definition(&observed));
    }

    #[test]
    fn test_probe_order_puts_startup_first() {
        let config = ServiceConfig {
            liveness_probe: Some(Probe::new(ProbeHandler::Tcp { port: 80 })),
            startup_probe: Some(Probe::new(ProbeHandler::Exec {
                command: vec!["true".into()],
            })),
            ..ServiceConfig::default()
        };
        let kinds: Vec<ProbeKind> = config.probes().into_iter().map(|(k, _)| k).collect();
        assert_eq!(kinds, vec![ProbeKind::Startup, ProbeKind::Liveness]);
    }

    #[test]
    fn test_default_error_backoff_never_gives_up() {
        let backoff = Settings::default().error_backoff;
        assert_eq!(backoff.max_attempts, u32::MAX);
        assert_eq!(backoff.delay_for_attempt(1), std::time::Duration::from_secs(1));
        assert_eq!(
            backoff.delay_for_attempt(500),
            std::time::Duration::from_millis(backoff.max_delay_ms)
        );
    }
}
