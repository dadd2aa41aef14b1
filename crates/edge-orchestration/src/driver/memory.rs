//! In-memory driver with scriptable failures, for tests.
//!
//! Simulates a container backend: instances move between created, running,
//! paused and stopped exactly like a real engine would report them. Every
//! mutating call is logged so tests can assert on what the reconciler did.

use super::{AppResource, CommandOutput, Driver, DriverBase, DriverContext, LogStream};
use crate::{
    Error, Result,
    health::{ProbeOutcome, ProbeRunner},
    model::{
        LogLine, LogOptions, LogSource, Network, Probe, Service, ServiceKey, ServiceMetrics,
        ServiceState, ServiceStatus, Volume,
    },
    runtime::sleep,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Operations that can be observed and scripted to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryOp {
    /// `create_service`
    Create,
    /// `start_service`
    Start,
    /// `stop_service`
    Stop,
    /// `remove_service`
    Remove,
    /// `restart_service`
    Restart,
    /// `pause_service`
    Pause,
    /// `create_network`
    CreateNetwork,
    /// `remove_network`
    RemoveNetwork,
    /// `create_volume`
    CreateVolume,
    /// `remove_volume`
    RemoveVolume,
}

/// One recorded driver call.
///
/// `target` is the service key (`app/service`) or `app/name` for networks
/// and volumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverCall {
    /// Operation
    pub op: MemoryOp,
    /// What it was applied to
    pub target: String,
}

type ErrorFactory = Arc<dyn Fn() -> Error + Send + Sync>;

struct Failure {
    remaining: Option<u32>,
    make: ErrorFactory,
}

struct Instance {
    definition: Service,
    instance_id: String,
    status: ServiceStatus,
    logs: Vec<LogLine>,
}

impl Instance {
    fn observed(&self) -> Service {
        let mut service = self.definition.clone();
        service.instance_id = Some(self.instance_id.clone());
        service.status = Some(self.status.clone());
        service.error = None;
        service
    }
}

#[derive(Default)]
struct Backend {
    instances: BTreeMap<ServiceKey, Instance>,
    networks: BTreeMap<(String, String), Network>,
    volumes: BTreeMap<(String, String), Volume>,
    next_id: u64,
}

#[derive(Default)]
struct ScriptedProbes {
    outcomes: Mutex<HashMap<ServiceKey, ProbeOutcome>>,
}

#[async_trait]
impl ProbeRunner for ScriptedProbes {
    async fn run_probe(&self, service: &Service, _probe: &Probe) -> ProbeOutcome {
        guard(&self.outcomes)
            .get(&service.key())
            .cloned()
            .unwrap_or(ProbeOutcome::Success)
    }
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Driver keeping all backend state in memory
pub struct MemoryDriver {
    base: DriverBase,
    probes: Arc<ScriptedProbes>,
    backend: Mutex<Backend>,
    failures: Mutex<HashMap<(MemoryOp, String), Failure>>,
    calls: Mutex<Vec<DriverCall>>,
    reachable: AtomicBool,
    latency: Mutex<Duration>,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    /// Driver using the default context
    pub fn new() -> Self {
        Self::with_context(DriverContext::new())
    }

    /// Driver using a specific context
    pub fn with_context(context: DriverContext) -> Self {
        let probes = Arc::new(ScriptedProbes::default());
        Self {
            base: DriverBase::new("memory", probes.clone(), context),
            probes,
            backend: Mutex::new(Backend::default()),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    /// Make every call to `op` on `target` fail with the produced error
    pub fn fail(&self, op: MemoryOp, target: impl Into<String>, error: impl Fn() -> Error + Send + Sync + 'static) {
        guard(&self.failures).insert(
            (op, target.into()),
            Failure {
                remaining: None,
                make: Arc::new(error),
            },
        );
    }

    /// Make the next `times` calls to `op` on `target` fail
    pub fn fail_times(
        &self,
        op: MemoryOp,
        target: impl Into<String>,
        times: u32,
        error: impl Fn() -> Error + Send + Sync + 'static,
    ) {
        guard(&self.failures).insert(
            (op, target.into()),
            Failure {
                remaining: Some(times),
                make: Arc::new(error),
            },
        );
    }

    /// Remove all scripted failures
    pub fn clear_failures(&self) {
        guard(&self.failures).clear();
    }

    /// Simulate the backend going away or coming back
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Delay applied to every mutating call
    pub fn set_latency(&self, latency: Duration) {
        *guard(&self.latency) = latency;
    }

    /// Outcome every probe of a service returns from now on
    pub fn set_probe_outcome(&self, key: &ServiceKey, outcome: ProbeOutcome) {
        guard(&self.probes.outcomes).insert(key.clone(), outcome);
    }

    /// Recorded calls, oldest first
    pub fn calls(&self) -> Vec<DriverCall> {
        guard(&self.calls).clone()
    }

    /// Targets of recorded calls to `op`
    pub fn calls_of(&self, op: MemoryOp) -> Vec<String> {
        guard(&self.calls)
            .iter()
            .filter(|call| call.op == op)
            .map(|call| call.target.clone())
            .collect()
    }

    /// Forget recorded calls
    pub fn clear_calls(&self) {
        guard(&self.calls).clear();
    }

    /// Put an instance on the backend as if it already existed
    pub fn seed_service(&self, service: Service, state: ServiceState) {
        let mut backend = guard(&self.backend);
        backend.next_id += 1;
        let instance_id = format!("mem-{}", backend.next_id);
        let mut status = ServiceStatus::new(state);
        if state == ServiceState::Running {
            status.started_at = Some(self.base.clock().now());
        }
        backend.instances.insert(
            service.key(),
            Instance {
                definition: service,
                instance_id,
                status,
                logs: Vec::new(),
            },
        );
    }

    /// Put a network on the backend as if it already existed
    pub fn seed_network(&self, app_id: &str, network: Network) {
        guard(&self.backend)
            .networks
            .insert((app_id.to_string(), network.name.clone()), network);
    }

    /// Change the reported state of an instance behind the driver's back
    pub fn set_observed_state(&self, key: &ServiceKey, state: ServiceState) {
        if let Some(instance) = guard(&self.backend).instances.get_mut(key) {
            instance.status.state = state;
        }
    }

    /// Bump the backend restart counter of an instance
    pub fn set_restart_count(&self, key: &ServiceKey, restart_count: u32) {
        if let Some(instance) = guard(&self.backend).instances.get_mut(key) {
            instance.status.restart_count = restart_count;
        }
    }

    /// Append a log line to an instance
    pub fn push_log(&self, key: &ServiceKey, source: LogSource, message: impl Into<String>) {
        let timestamp = self.base.clock().now();
        if let Some(instance) = guard(&self.backend).instances.get_mut(key) {
            instance.logs.push(LogLine {
                source,
                message: message.into(),
                timestamp: Some(timestamp),
            });
        }
    }

    /// Observed view of one instance
    pub fn instance(&self, key: &ServiceKey) -> Option<Service> {
        guard(&self.backend).instances.get(key).map(Instance::observed)
    }

    /// Number of instances on the backend
    pub fn instance_count(&self) -> usize {
        guard(&self.backend).instances.len()
    }

    /// Names of the networks of an app
    pub fn network_names(&self, app_id: &str) -> Vec<String> {
        guard(&self.backend)
            .networks
            .keys()
            .filter(|(app, _)| app == app_id)
            .map(|(_, name)| name.clone())
            .collect()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::BackendUnreachable("memory backend is offline".to_string()))
        }
    }

    /// Shared preamble of every mutating call
    async fn call(&self, op: MemoryOp, target: String) -> Result<()> {
        self.base.ensure_ready()?;
        self.check_reachable()?;
        guard(&self.calls).push(DriverCall {
            op,
            target: target.clone(),
        });

        let latency = *guard(&self.latency);
        if !latency.is_zero() {
            sleep(latency).await;
        }

        let mut failures = guard(&self.failures);
        let key = (op, target);
        let Some(failure) = failures.get_mut(&key) else {
            return Ok(());
        };
        let error = (failure.make)();
        if let Some(remaining) = failure.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                failures.remove(&key);
            }
        }
        debug!("Injected {:?} failure on {}: {}", op, key.1, error);
        Err(error)
    }

    fn with_instance<T>(&self, key: &ServiceKey, f: impl FnOnce(&mut Instance) -> Result<T>) -> Result<T> {
        let mut backend = guard(&self.backend);
        let instance = backend
            .instances
            .get_mut(key)
            .ok_or_else(|| Error::ServiceNotFound(key.to_string()))?;
        f(instance)
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn base(&self) -> &DriverBase {
        &self.base
    }

    async fn init(&self) -> Result<()> {
        self.check_reachable()?;
        self.base.mark_ready();
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.base.shutdown().await;
        Ok(())
    }

    async fn create_service(&self, service: &Service) -> Result<String> {
        let key = service.key();
        self.call(MemoryOp::Create, key.to_string()).await?;
        let now = self.base.clock().now();

        let mut backend = guard(&self.backend);
        if backend.instances.contains_key(&key) {
            return Err(Error::Backend(format!("instance for {} already exists", key)));
        }
        backend.next_id += 1;
        let instance_id = format!("mem-{}", backend.next_id);

        let mut status = ServiceStatus::new(ServiceState::Stopped);
        if service.state == crate::model::DesiredState::Running {
            status.state = ServiceState::Running;
            status.started_at = Some(now);
        }
        let mut definition = service.clone();
        definition.instance_id = None;
        definition.status = None;
        definition.error = None;

        backend.instances.insert(
            key,
            Instance {
                definition,
                instance_id: instance_id.clone(),
                status,
                logs: Vec::new(),
            },
        );
        Ok(instance_id)
    }

    async fn start_service(&self, service: &Service) -> Result<()> {
        let key = service.key();
        self.call(MemoryOp::Start, key.to_string()).await?;
        let now = self.base.clock().now();
        self.with_instance(&key, |instance| {
            if instance.status.state != ServiceState::Paused {
                instance.status.started_at = Some(now);
            }
            instance.status.state = ServiceState::Running;
            Ok(())
        })
    }

    async fn stop_service(&self, service: &Service, _timeout: Duration) -> Result<()> {
        let key = service.key();
        self.call(MemoryOp::Stop, key.to_string()).await?;
        let now = self.base.clock().now();
        self.with_instance(&key, |instance| {
            if matches!(instance.status.state, ServiceState::Running | ServiceState::Paused) {
                instance.status.state = ServiceState::Stopped;
                instance.status.finished_at = Some(now);
                instance.status.exit_code = Some(0);
            }
            Ok(())
        })
    }

    async fn remove_service(&self, service: &Service, force: bool) -> Result<()> {
        let key = service.key();
        self.call(MemoryOp::Remove, key.to_string()).await?;
        let mut backend = guard(&self.backend);
        let instance = backend
            .instances
            .get(&key)
            .ok_or_else(|| Error::ServiceNotFound(key.to_string()))?;
        if !force && matches!(instance.status.state, ServiceState::Running | ServiceState::Paused) {
            return Err(Error::Backend(format!(
                "cannot remove {} instance {} without force",
                instance.status.state, instance.instance_id
            )));
        }
        backend.instances.remove(&key);
        Ok(())
    }

    async fn restart_service(&self, service: &Service, _timeout: Duration) -> Result<()> {
        let key = service.key();
        self.call(MemoryOp::Restart, key.to_string()).await?;
        let now = self.base.clock().now();
        self.with_instance(&key, |instance| {
            instance.status.state = ServiceState::Running;
            instance.status.started_at = Some(now);
            instance.status.finished_at = None;
            instance.status.exit_code = None;
            Ok(())
        })
    }

    async fn pause_service(&self, service: &Service) -> Result<()> {
        let key = service.key();
        self.call(MemoryOp::Pause, key.to_string()).await?;
        self.with_instance(&key, |instance| match instance.status.state {
            ServiceState::Running | ServiceState::Paused => {
                instance.status.state = ServiceState::Paused;
                Ok(())
            }
            other => Err(Error::Backend(format!(
                "cannot pause {} instance {}",
                other, instance.instance_id
            ))),
        })
    }

    async fn get_service_status(&self, service: &Service) -> Result<ServiceStatus> {
        self.base.ensure_ready()?;
        self.check_reachable()?;
        self.with_instance(&service.key(), |instance| Ok(instance.status.clone()))
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        self.base.ensure_ready()?;
        self.check_reachable()?;
        Ok(guard(&self.backend)
            .instances
            .values()
            .map(Instance::observed)
            .collect())
    }

    async fn exec_in_service(&self, service: &Service, command: &[String]) -> Result<CommandOutput> {
        self.base.ensure_ready()?;
        self.with_instance(&service.key(), |instance| {
            if instance.status.state != ServiceState::Running {
                return Err(Error::Backend(format!(
                    "instance {} is not running",
                    instance.instance_id
                )));
            }
            Ok(CommandOutput {
                code: Some(0),
                stdout: command.join(" "),
                stderr: String::new(),
            })
        })
    }

    async fn get_service_logs(&self, service: &Service, options: &LogOptions) -> Result<LogStream> {
        self.base.ensure_ready()?;
        let lines = self.with_instance(&service.key(), |instance| Ok(instance.logs.clone()))?;
        let mut lines: Vec<LogLine> = lines
            .into_iter()
            .filter(|line| match line.source {
                LogSource::Stdout => options.stdout,
                LogSource::Stderr => options.stderr,
            })
            .filter(|line| match (options.since, line.timestamp) {
                (Some(since), Some(at)) => at >= since,
                _ => true,
            })
            .collect();
        if let Some(tail) = options.tail {
            let skip = lines.len().saturating_sub(tail);
            lines.drain(..skip);
        }
        if !options.timestamps {
            for line in &mut lines {
                line.timestamp = None;
            }
        }
        Ok(stream::iter(lines.into_iter().map(Ok)).boxed())
    }

    async fn get_service_metrics(&self, service: &Service) -> Result<ServiceMetrics> {
        self.base.ensure_ready()?;
        let limit = service.config.resources.memory_bytes;
        let running = self.with_instance(&service.key(), |instance| {
            Ok(instance.status.state == ServiceState::Running)
        })?;
        Ok(ServiceMetrics {
            app_id: service.app_id.clone(),
            service_name: service.service_name.clone(),
            cpu_percent: if running { 1.0 } else { 0.0 },
            memory_usage_bytes: if running { 16 * 1024 * 1024 } else { 0 },
            memory_limit_bytes: limit,
            network_rx_bytes: 0,
            network_tx_bytes: 0,
            timestamp: self.base.clock().now(),
        })
    }

    async fn create_network(&self, app_id: &str, network: &Network) -> Result<()> {
        self.call(MemoryOp::CreateNetwork, format!("{}/{}", app_id, network.name))
            .await?;
        guard(&self.backend)
            .networks
            .insert((app_id.to_string(), network.name.clone()), network.clone());
        Ok(())
    }

    async fn remove_network(&self, app_id: &str, name: &str) -> Result<()> {
        self.call(MemoryOp::RemoveNetwork, format!("{}/{}", app_id, name))
            .await?;
        let mut backend = guard(&self.backend);
        let in_use = backend
            .instances
            .values()
            .any(|i| i.definition.app_id == app_id && i.definition.config.networks.iter().any(|n| n == name));
        if in_use {
            return Err(Error::Backend(format!("network {}/{} has active endpoints", app_id, name)));
        }
        backend.networks.remove(&(app_id.to_string(), name.to_string()));
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<AppResource<Network>>> {
        self.base.ensure_ready()?;
        self.check_reachable()?;
        Ok(guard(&self.backend)
            .networks
            .iter()
            .map(|((app_id, _), network)| (app_id.clone(), network.clone()))
            .collect())
    }

    async fn create_volume(&self, app_id: &str, volume: &Volume) -> Result<()> {
        self.call(MemoryOp::CreateVolume, format!("{}/{}", app_id, volume.name))
            .await?;
        guard(&self.backend)
            .volumes
            .insert((app_id.to_string(), volume.name.clone()), volume.clone());
        Ok(())
    }

    async fn remove_volume(&self, app_id: &str, name: &str) -> Result<()> {
        self.call(MemoryOp::RemoveVolume, format!("{}/{}", app_id, name))
            .await?;
        guard(&self.backend)
            .volumes
            .remove(&(app_id.to_string(), name.to_string()));
        Ok(())
    }

    async fn list_volumes(&self) -> Result<Vec<AppResource<Volume>>> {
        self.base.ensure_ready()?;
        self.check_reachable()?;
        Ok(guard(&self.backend)
            .volumes
            .iter()
            .map(|((app_id, _), volume)| (app_id.clone(), volume.clone()))
            .collect())
    }
}
