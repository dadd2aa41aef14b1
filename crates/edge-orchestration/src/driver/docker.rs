//! Driver for a standalone container engine, driven through its CLI.
//!
//! Containers, networks and volumes created by the agent carry the
//! [`labels`] so they can be found again after an agent restart. The
//! service configuration an instance was created from is stored as JSON in
//! a label; comparing it against the target decides whether a recreate is
//! needed.

use super::{
    AppResource, CliRunner, CommandOutput, Driver, DriverBase, DriverContext, LogStream,
    desired_from_observed, labels, scoped_name,
};
use crate::{
    Error, Result,
    health::{ProbeOutcome, ProbeRunner, http_probe, tcp_probe},
    model::{
        DesiredState, HealthState, LogOptions, LogSource, Network, Probe, ProbeHandler, Service,
        ServiceConfig, ServiceMetrics, ServiceState, ServiceStatus, Volume,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use futures::stream::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connection options for the container engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// CLI binary
    pub binary: String,
    /// Engine endpoint passed as `-H`; the CLI default when unset
    pub host: Option<String>,
    /// Deadline for a single CLI invocation
    pub command_timeout_secs: u64,
    /// Address used to reach published ports for network probes
    pub probe_host: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            host: None,
            command_timeout_secs: 120,
            probe_host: "127.0.0.1".to_string(),
        }
    }
}

impl DockerConfig {
    fn runner(&self) -> CliRunner {
        let mut global = Vec::new();
        if let Some(host) = &self.host {
            global.push("-H".to_string());
            global.push(host.clone());
        }
        CliRunner::new(&self.binary)
            .with_global_args(global)
            .with_timeout(Duration::from_secs(self.command_timeout_secs))
    }
}

/// Container name for a service
pub fn container_name(service: &Service) -> String {
    format!("{}_{}_{}", service.service_name, service.service_id, service.app_id)
}

fn instance_ref(service: &Service) -> String {
    service
        .instance_id
        .clone()
        .unwrap_or_else(|| container_name(service))
}

/// Driver for the standalone container engine
pub struct DockerDriver {
    base: DriverBase,
    cli: CliRunner,
}

impl DockerDriver {
    /// Create a driver; nothing is contacted until `init`
    pub fn new(config: DockerConfig, context: DriverContext) -> Self {
        let cli = config.runner();
        let runner = Arc::new(DockerProbeRunner {
            cli: cli.clone(),
            probe_host: config.probe_host.clone(),
        });
        Self {
            base: DriverBase::new("docker", runner, context),
            cli,
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        let present = self.cli.run(&["image", "inspect", image]).await?;
        if present.success() {
            return Ok(());
        }
        info!("Pulling image {}", image);
        let pulled = self.cli.run(&["pull", image]).await?;
        if pulled.success() {
            Ok(())
        } else {
            Err(Error::ImagePull {
                image: image.to_string(),
                message: pulled.message(),
            })
        }
    }

    async fn inspect(&self, refs: &[String]) -> Result<Vec<Service>> {
        if refs.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["inspect".to_string(), "--type".to_string(), "container".to_string()];
        args.extend(refs.iter().cloned());
        let output = self.cli.run(&args).await?;
        if !output.success() {
            let message = output.message();
            if message.contains("No such") {
                return Err(Error::ServiceNotFound(refs.join(", ")));
            }
            return Err(Error::Backend(message));
        }
        parse_containers(&output.stdout)
    }

    /// Map a failed mutating command, treating "No such container" as not found
    fn check(&self, service: &Service, output: CommandOutput) -> Result<()> {
        if output.success() {
            return Ok(());
        }
        let message = output.message();
        if message.contains("No such container") {
            Err(Error::ServiceNotFound(container_name(service)))
        } else {
            Err(Error::Backend(message))
        }
    }
}

#[async_trait]
impl Driver for DockerDriver {
    fn base(&self) -> &DriverBase {
        &self.base
    }

    async fn init(&self) -> Result<()> {
        let output = self
            .cli
            .run(&["version", "--format", "{{.Server.Version}}"])
            .await
            .map_err(|e| Error::BackendUnreachable(e.to_string()))?;
        if !output.success() {
            return Err(Error::BackendUnreachable(output.message()));
        }
        info!("Connected to container engine {}", output.stdout.trim());
        self.base.mark_ready();
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.base.shutdown().await;
        Ok(())
    }

    async fn get_health(&self) -> crate::model::DriverHealth {
        let mut report = self.base.health_report();
        if report.healthy {
            if let Err(e) = self.cli.run_checked(&["version", "--format", "{{.Server.Version}}"]).await {
                report.healthy = false;
                report.message = Some(e.to_string());
            }
        }
        report
    }

    async fn create_service(&self, service: &Service) -> Result<String> {
        self.base.ensure_ready()?;
        self.base.log_action("Creating", service);
        self.ensure_image(&service.image).await?;

        // A leftover container with the same name would make create fail
        let name = container_name(service);
        let cleared = self.cli.run(&["rm", "-f", name.as_str()]).await?;
        if !cleared.success() {
            let message = cleared.message();
            if !message.contains("No such container") {
                return Err(Error::Backend(message));
            }
        }

        let output = self.cli.run(&create_args(service)?).await?;
        if !output.success() {
            let message = output.message();
            if is_image_error(&message) {
                return Err(Error::ImagePull {
                    image: service.image.clone(),
                    message,
                });
            }
            return Err(Error::Backend(message));
        }
        let instance_id = output.stdout.trim().to_string();

        for network in service.config.networks.iter().skip(1) {
            let scoped = scoped_name(&service.app_id, network);
            self.cli
                .run_checked(&["network", "connect", scoped.as_str(), instance_id.as_str()])
                .await?;
        }

        if service.state == DesiredState::Running {
            let started = self.cli.run(&["start", instance_id.as_str()]).await?;
            if !started.success() {
                return Err(Error::StartFailure {
                    service: service.service_name.clone(),
                    message: started.message(),
                });
            }
        }
        Ok(instance_id)
    }

    async fn start_service(&self, service: &Service) -> Result<()> {
        self.base.ensure_ready()?;
        let target = instance_ref(service);
        let paused = service.observed_state() == ServiceState::Paused;
        let verb = if paused { "unpause" } else { "start" };
        self.base.log_action(if paused { "Unpausing" } else { "Starting" }, service);

        let output = self.cli.run(&[verb, target.as_str()]).await?;
        if output.success() {
            return Ok(());
        }
        let message = output.message();
        if message.contains("No such container") {
            Err(Error::ServiceNotFound(container_name(service)))
        } else {
            Err(Error::StartFailure {
                service: service.service_name.clone(),
                message,
            })
        }
    }

    async fn stop_service(&self, service: &Service, timeout: Duration) -> Result<()> {
        self.base.ensure_ready()?;
        self.base.log_action("Stopping", service);
        let target = instance_ref(service);
        let secs = timeout.as_secs().to_string();
        let output = self.cli.run(&["stop", "-t", secs.as_str(), target.as_str()]).await?;
        self.check(service, output)
    }

    async fn remove_service(&self, service: &Service, force: bool) -> Result<()> {
        self.base.ensure_ready()?;
        self.base.log_action("Removing", service);
        let target = instance_ref(service);
        let mut args = vec!["rm", "-v"];
        if force {
            args.push("-f");
        }
        args.push(target.as_str());
        let output = self.cli.run(&args).await?;
        self.check(service, output)
    }

    async fn restart_service(&self, service: &Service, timeout: Duration) -> Result<()> {
        self.base.ensure_ready()?;
        self.base.log_action("Restarting", service);
        let target = instance_ref(service);
        let secs = timeout.as_secs().to_string();
        let output = self
            .cli
            .run(&["restart", "-t", secs.as_str(), target.as_str()])
            .await?;
        self.check(service, output)
    }

    async fn pause_service(&self, service: &Service) -> Result<()> {
        self.base.ensure_ready()?;
        self.base.log_action("Pausing", service);
        let target = instance_ref(service);
        let output = self.cli.run(&["pause", target.as_str()]).await?;
        self.check(service, output)
    }

    async fn get_service_status(&self, service: &Service) -> Result<ServiceStatus> {
        self.base.ensure_ready()?;
        let observed = self.inspect(&[instance_ref(service)]).await?;
        observed
            .into_iter()
            .next()
            .and_then(|s| s.status)
            .ok_or_else(|| Error::ServiceNotFound(container_name(service)))
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        self.base.ensure_ready()?;
        let filter = format!("label={}=true", labels::MANAGED);
        let ids = self
            .cli
            .run(&["ps", "-a", "-q", "--no-trunc", "--filter", filter.as_str()])
            .await?;
        if !ids.success() {
            return Err(Error::BackendUnreachable(ids.message()));
        }
        let ids: Vec<String> = ids
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();
        self.inspect(&ids).await
    }

    async fn exec_in_service(&self, service: &Service, command: &[String]) -> Result<CommandOutput> {
        self.base.ensure_ready()?;
        let mut args = vec!["exec".to_string(), instance_ref(service)];
        args.extend(command.iter().cloned());
        self.cli.run(&args).await
    }

    async fn get_service_logs(&self, service: &Service, options: &LogOptions) -> Result<LogStream> {
        self.base.ensure_ready()?;
        let args = log_args(&instance_ref(service), options);
        let (stdout, stderr) = (options.stdout, options.stderr);
        let lines = self.cli.stream_lines(&args, options.timestamps)?;
        Ok(lines
            .filter(move |line| {
                let keep = match line {
                    Ok(line) => match line.source {
                        LogSource::Stdout => stdout,
                        LogSource::Stderr => stderr,
                    },
                    Err(_) => true,
                };
                futures::future::ready(keep)
            })
            .boxed())
    }

    async fn get_service_metrics(&self, service: &Service) -> Result<ServiceMetrics> {
        self.base.ensure_ready()?;
        let target = instance_ref(service);
        let stdout = self
            .cli
            .run_checked(&["stats", "--no-stream", "--format", "{{json .}}", target.as_str()])
            .await?;
        let line = stdout
            .lines()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| Error::ServiceNotFound(container_name(service)))?;
        parse_stats(line, service, self.base.clock().now())
    }

    async fn create_network(&self, app_id: &str, network: &Network) -> Result<()> {
        self.base.ensure_ready()?;
        let scoped = scoped_name(app_id, &network.name);
        let mut args = vec!["network".to_string(), "create".to_string()];
        args.extend(resource_labels(app_id, labels::NETWORK_NAME, &network.name, &network.labels));
        if let Some(driver) = &network.driver {
            args.push("--driver".to_string());
            args.push(driver.clone());
        }
        args.push(scoped.clone());

        let output = self.cli.run(&args).await?;
        if output.success() || output.message().contains("already exists") {
            debug!("Network {} present", scoped);
            Ok(())
        } else {
            Err(Error::Backend(output.message()))
        }
    }

    async fn remove_network(&self, app_id: &str, name: &str) -> Result<()> {
        self.base.ensure_ready()?;
        let scoped = scoped_name(app_id, name);
        let output = self.cli.run(&["network", "rm", scoped.as_str()]).await?;
        if output.success() || output.message().contains("not found") {
            Ok(())
        } else {
            Err(Error::Backend(output.message()))
        }
    }

    async fn list_networks(&self) -> Result<Vec<AppResource<Network>>> {
        self.base.ensure_ready()?;
        let filter = format!("label={}=true", labels::MANAGED);
        let stdout = self
            .cli
            .run_checked(&["network", "ls", "--filter", filter.as_str(), "--format", "{{json .}}"])
            .await?;
        Ok(parse_resources(&stdout, labels::NETWORK_NAME)?
            .into_iter()
            .map(|(app_id, name, driver, labels)| {
                (
                    app_id,
                    Network {
                        name,
                        driver,
                        labels,
                    },
                )
            })
            .collect())
    }

    async fn create_volume(&self, app_id: &str, volume: &Volume) -> Result<()> {
        self.base.ensure_ready()?;
        let scoped = scoped_name(app_id, &volume.name);
        let mut args = vec!["volume".to_string(), "create".to_string()];
        args.extend(resource_labels(app_id, labels::VOLUME_NAME, &volume.name, &volume.labels));
        if let Some(driver) = &volume.driver {
            args.push("--driver".to_string());
            args.push(driver.clone());
        }
        args.push(scoped);
        self.cli.run_checked(&args).await.map(|_| ())
    }

    async fn remove_volume(&self, app_id: &str, name: &str) -> Result<()> {
        self.base.ensure_ready()?;
        let scoped = scoped_name(app_id, name);
        let output = self.cli.run(&["volume", "rm", scoped.as_str()]).await?;
        if output.success() || output.message().contains("no such volume") {
            Ok(())
        } else {
            Err(Error::Backend(output.message()))
        }
    }

    async fn list_volumes(&self) -> Result<Vec<AppResource<Volume>>> {
        self.base.ensure_ready()?;
        let filter = format!("label={}=true", labels::MANAGED);
        let stdout = self
            .cli
            .run_checked(&["volume", "ls", "--filter", filter.as_str(), "--format", "{{json .}}"])
            .await?;
        Ok(parse_resources(&stdout, labels::VOLUME_NAME)?
            .into_iter()
            .map(|(app_id, name, driver, labels)| {
                (
                    app_id,
                    Volume {
                        name,
                        driver,
                        labels,
                    },
                )
            })
            .collect())
    }
}

/// Probes against containers: published ports for HTTP/TCP, `exec` otherwise
struct DockerProbeRunner {
    cli: CliRunner,
    probe_host: String,
}

impl DockerProbeRunner {
    async fn address(&self, service: &Service, container_port: u16) -> Option<(String, u16)> {
        if let Some(mapping) = service
            .config
            .ports
            .iter()
            .find(|p| p.container_port == container_port)
        {
            return Some((self.probe_host.clone(), mapping.host_port));
        }
        let target = instance_ref(service);
        let output = self
            .cli
            .run_checked(&[
                "inspect",
                "-f",
                "{{range .NetworkSettings.Networks}}{{.IPAddress}} {{end}}",
                target.as_str(),
            ])
            .await
            .ok()?;
        output
            .split_whitespace()
            .next()
            .map(|ip| (ip.to_string(), container_port))
    }
}

#[async_trait]
impl ProbeRunner for DockerProbeRunner {
    async fn run_probe(&self, service: &Service, probe: &Probe) -> ProbeOutcome {
        match &probe.handler {
            ProbeHandler::Exec { command } => {
                let mut args = vec!["exec".to_string(), instance_ref(service)];
                args.extend(command.iter().cloned());
                match self.cli.run(&args).await {
                    Ok(output) if output.success() => ProbeOutcome::Success,
                    Ok(output) => ProbeOutcome::Failure(format!(
                        "exit code {:?}: {}",
                        output.code,
                        output.message()
                    )),
                    Err(e) => ProbeOutcome::Failure(e.to_string()),
                }
            }
            ProbeHandler::Tcp { port } => match self.address(service, *port).await {
                Some((host, port)) => tcp_probe(&host, port).await,
                None => ProbeOutcome::Failure("container has no reachable address".to_string()),
            },
            ProbeHandler::Http { path, port } => match self.address(service, *port).await {
                Some((host, port)) => http_probe(&host, port, path).await,
                None => ProbeOutcome::Failure("container has no reachable address".to_string()),
            },
        }
    }
}

fn is_image_error(message: &str) -> bool {
    let message = message.to_lowercase();
    ["pull access denied", "manifest unknown", "unable to find image", "repository does not exist"]
        .iter()
        .any(|needle| message.contains(needle))
}

fn label_arg(key: &str, value: &str) -> [String; 2] {
    ["--label".to_string(), format!("{}={}", key, value)]
}

fn resource_labels(
    app_id: &str,
    name_key: &str,
    name: &str,
    user: &std::collections::BTreeMap<String, String>,
) -> Vec<String> {
    let mut args = Vec::new();
    args.extend(label_arg(labels::MANAGED, "true"));
    args.extend(label_arg(labels::APP_ID, app_id));
    args.extend(label_arg(name_key, name));
    for (key, value) in user {
        args.extend(label_arg(key, value));
    }
    args
}

/// Arguments for `docker create`
pub fn create_args(service: &Service) -> Result<Vec<String>> {
    let config = &service.config;
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        container_name(service),
    ];

    args.extend(label_arg(labels::MANAGED, "true"));
    args.extend(label_arg(labels::APP_ID, &service.app_id));
    args.extend(label_arg(labels::APP_NAME, &service.app_name));
    args.extend(label_arg(labels::SERVICE_ID, &service.service_id));
    args.extend(label_arg(labels::SERVICE_NAME, &service.service_name));
    args.extend(label_arg(labels::IMAGE, &service.image));
    args.extend(label_arg(labels::SERVICE_CONFIG, &serde_json::to_string(config)?));
    for (key, value) in &config.labels {
        args.extend(label_arg(key, value));
    }

    for (key, value) in &config.environment {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    for port in &config.ports {
        args.push("-p".to_string());
        args.push(format!("{}:{}/{}", port.host_port, port.container_port, port.protocol));
    }
    for mount in &config.volumes {
        let source = if mount.is_bind() {
            mount.source.clone()
        } else {
            scoped_name(&service.app_id, &mount.source)
        };
        let mut spec = format!("{}:{}", source, mount.target);
        if mount.read_only {
            spec.push_str(":ro");
        }
        args.push("-v".to_string());
        args.push(spec);
    }
    if let Some(network) = config.networks.first() {
        args.push("--network".to_string());
        args.push(scoped_name(&service.app_id, network));
    }
    if let Some(cpu) = config.resources.cpu_millis {
        args.push("--cpus".to_string());
        args.push(format!("{:.3}", cpu as f64 / 1000.0));
    }
    if let Some(memory) = config.resources.memory_bytes {
        args.push("--memory".to_string());
        args.push(memory.to_string());
    }

    args.push(service.image.clone());
    args.extend(config.command.iter().cloned());
    Ok(args)
}

fn log_args(target: &str, options: &LogOptions) -> Vec<String> {
    let mut args = vec!["logs".to_string()];
    if options.follow {
        args.push("--follow".to_string());
    }
    if options.timestamps {
        args.push("--timestamps".to_string());
    }
    if let Some(tail) = options.tail {
        args.push("--tail".to_string());
        args.push(tail.to_string());
    }
    if let Some(since) = options.since {
        args.push("--since".to_string());
        args.push(since.to_rfc3339());
    }
    args.push(target.to_string());
    args
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedContainer {
    id: String,
    state: InspectedState,
    #[serde(default)]
    restart_count: u32,
    config: InspectedConfig,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedState {
    status: String,
    #[serde(default)]
    exit_code: Option<i64>,
    #[serde(default)]
    started_at: Option<String>,
    #[serde(default)]
    finished_at: Option<String>,
    #[serde(default)]
    health: Option<InspectedHealth>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedHealth {
    status: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectedConfig {
    image: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

/// Engine timestamps use year 1 for "never"
fn parse_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw?).ok()?.with_timezone(&Utc);
    (parsed.year() >= 1970).then_some(parsed)
}

fn map_state(status: &str) -> ServiceState {
    match status {
        "running" => ServiceState::Running,
        "paused" => ServiceState::Paused,
        "created" | "exited" => ServiceState::Stopped,
        "restarting" | "dead" => ServiceState::Error,
        _ => ServiceState::Unknown,
    }
}

fn map_health(health: Option<&InspectedHealth>) -> HealthState {
    match health.map(|h| h.status.as_str()) {
        Some("healthy") => HealthState::Healthy,
        Some("unhealthy") => HealthState::Unhealthy,
        Some("starting") => HealthState::Starting,
        _ => HealthState::Unknown,
    }
}

/// Parse `docker inspect` output into observed services; unmanaged containers are skipped
pub fn parse_containers(json: &str) -> Result<Vec<Service>> {
    let containers: Vec<InspectedContainer> = serde_json::from_str(json)?;
    let mut services = Vec::new();

    for container in containers {
        let tags = container.config.labels.unwrap_or_default();
        if tags.get(labels::MANAGED).map(String::as_str) != Some("true") {
            continue;
        }
        let (Some(app_id), Some(service_id)) = (tags.get(labels::APP_ID), tags.get(labels::SERVICE_ID))
        else {
            warn!("Managed container {} lacks identity labels", container.id);
            continue;
        };

        let config = match tags.get(labels::SERVICE_CONFIG) {
            Some(raw) => serde_json::from_str::<ServiceConfig>(raw).unwrap_or_else(|e| {
                warn!("Unreadable config label on container {}: {}", container.id, e);
                ServiceConfig::default()
            }),
            None => ServiceConfig::default(),
        };

        let state = map_state(&container.state.status);
        let status = ServiceStatus {
            state,
            started_at: parse_time(container.state.started_at.as_deref()),
            finished_at: parse_time(container.state.finished_at.as_deref()),
            exit_code: if state == ServiceState::Running {
                None
            } else {
                container.state.exit_code
            },
            restart_count: container.restart_count,
            health: map_health(container.state.health.as_ref()),
        };

        services.push(Service {
            service_id: service_id.clone(),
            service_name: tags.get(labels::SERVICE_NAME).cloned().unwrap_or_default(),
            app_id: app_id.clone(),
            app_name: tags.get(labels::APP_NAME).cloned().unwrap_or_default(),
            image: tags
                .get(labels::IMAGE)
                .cloned()
                .unwrap_or(container.config.image),
            state: desired_from_observed(state),
            config,
            instance_id: Some(container.id),
            status: Some(status),
            error: None,
        });
    }

    Ok(services)
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StatsLine {
    #[serde(rename = "CPUPerc")]
    cpu_perc: String,
    mem_usage: String,
    #[serde(rename = "NetIO")]
    net_io: String,
}

/// Parse a human size such as `12.5MiB` or `3.4kB`
pub fn parse_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let value: f64 = number.parse().ok()?;
    let multiplier: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * multiplier) as u64)
}

fn split_pair(raw: &str) -> (Option<u64>, Option<u64>) {
    match raw.split_once('/') {
        Some((left, right)) => (parse_size(left), parse_size(right)),
        None => (parse_size(raw), None),
    }
}

/// Parse one `docker stats --format '{{json .}}'` line
pub fn parse_stats(line: &str, service: &Service, timestamp: DateTime<Utc>) -> Result<ServiceMetrics> {
    let stats: StatsLine = serde_json::from_str(line)?;
    let (memory_usage, memory_limit) = split_pair(&stats.mem_usage);
    let (rx, tx) = split_pair(&stats.net_io);
    Ok(ServiceMetrics {
        app_id: service.app_id.clone(),
        service_name: service.service_name.clone(),
        cpu_percent: stats.cpu_perc.trim_end_matches('%').trim().parse().unwrap_or(0.0),
        memory_usage_bytes: memory_usage.unwrap_or(0),
        memory_limit_bytes: memory_limit,
        network_rx_bytes: rx.unwrap_or(0),
        network_tx_bytes: tx.unwrap_or(0),
        timestamp,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListedResource {
    #[serde(default)]
    driver: Option<String>,
    #[serde(default)]
    labels: String,
}

/// Parse the comma-separated `k=v` label string of `ls` output
fn parse_label_string(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

type ParsedResource = (String, String, Option<String>, std::collections::BTreeMap<String, String>);

/// Parse `network ls` / `volume ls` JSON lines into (app id, name, driver, user labels)
fn parse_resources(stdout: &str, name_key: &str) -> Result<Vec<ParsedResource>> {
    let mut resources = Vec::new();
    for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
        let listed: ListedResource = serde_json::from_str(line)?;
        let mut tags = parse_label_string(&listed.labels);
        let (Some(app_id), Some(name)) = (tags.remove(labels::APP_ID), tags.remove(name_key)) else {
            continue;
        };
        tags.remove(labels::MANAGED);
        let driver = listed
            .driver
            .filter(|d| !d.is_empty() && d != "local" && d != "bridge");
        resources.push((app_id, name, driver, tags.into_iter().collect()));
    }
    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PortMapping, Protocol, ResourceLimits, VolumeMount};
    use chrono::TimeZone;

    fn web() -> Service {
        let mut service = Service::new("1", "10", "nginx", "nginx:1.27").with_config(ServiceConfig {
            environment: [("MODE".to_string(), "prod".to_string())].into(),
            ports: vec![PortMapping {
                host_port: 8080,
                container_port: 80,
                protocol: Protocol::Tcp,
            }],
            volumes: vec![
                VolumeMount {
                    source: "data".into(),
                    target: "/data".into(),
                    read_only: false,
                },
                VolumeMount {
                    source: "/etc/ssl".into(),
                    target: "/ssl".into(),
                    read_only: true,
                },
            ],
            networks: vec!["frontend".into()],
            resources: ResourceLimits {
                cpu_millis: Some(500),
                memory_bytes: Some(64 * 1024 * 1024),
            },
            ..ServiceConfig::default()
        });
        service.app_name = "web".into();
        service
    }

    #[test]
    fn test_create_args() {
        let args = create_args(&web()).unwrap();
        let joined = args.join(" ");
        assert!(joined.starts_with("create --name nginx_10_1 "));
        assert!(joined.contains("--label io.edge.managed=true"));
        assert!(joined.contains("-e MODE=prod"));
        assert!(joined.contains("-p 8080:80/tcp"));
        assert!(joined.contains("-v 1_data:/data"));
        assert!(joined.contains("-v /etc/ssl:/ssl:ro"));
        assert!(joined.contains("--network 1_frontend"));
        assert!(joined.contains("--cpus 0.500"));
        assert!(joined.contains("--memory 67108864"));
        assert_eq!(args.last().unwrap(), "nginx:1.27");
    }

    fn managed_labels(service: &Service) -> serde_json::Value {
        serde_json::json!({
            "io.edge.managed": "true",
            "io.edge.app-id": service.app_id,
            "io.edge.app-name": service.app_name,
            "io.edge.service-id": service.service_id,
            "io.edge.service-name": service.service_name,
            "io.edge.image": service.image,
            "io.edge.service-config": serde_json::to_string(&service.config).unwrap(),
        })
    }

    fn inspect_fixture(service: &Service, status: &str, exit_code: i64) -> String {
        let labels = managed_labels(service);
        serde_json::json!([
            {
                "Id": "abc123",
                "Name": "/nginx_10_1",
                "RestartCount": 2,
                "State": {
                    "Status": status,
                    "ExitCode": exit_code,
                    "StartedAt": "2024-05-01T10:00:00.5Z",
                    "FinishedAt": "0001-01-01T00:00:00Z",
                    "Health": { "Status": "healthy" }
                },
                "Config": { "Image": "nginx:1.27", "Labels": labels }
            },
            {
                "Id": "foreign",
                "Name": "/other",
                "State": { "Status": "running" },
                "Config": { "Image": "busybox", "Labels": null }
            }
        ])
        .to_string()
    }

    #[test]
    fn test_parse_containers_round_trips_definition() {
        let service = web();
        let parsed = parse_containers(&inspect_fixture(&service, "running", 0)).unwrap();
        assert_eq!(parsed.len(), 1);

        let observed = &parsed[0];
        assert!(observed.same_definition(&service));
        assert_eq!(observed.instance_id.as_deref(), Some("abc123"));
        let status = observed.status.as_ref().unwrap();
        assert_eq!(status.state, ServiceState::Running);
        assert_eq!(status.restart_count, 2);
        assert_eq!(status.health, HealthState::Healthy);
        assert!(status.started_at.is_some());
        assert!(status.finished_at.is_none());
        assert!(status.exit_code.is_none());
    }

    #[test]
    fn test_parse_containers_states() {
        let service = web();
        let created = parse_containers(&inspect_fixture(&service, "created", 0)).unwrap();
        assert_eq!(created[0].observed_state(), ServiceState::Stopped);
        assert_eq!(created[0].state, DesiredState::Stopped);

        let paused = parse_containers(&inspect_fixture(&service, "paused", 0)).unwrap();
        assert_eq!(paused[0].observed_state(), ServiceState::Paused);

        let dead = parse_containers(&inspect_fixture(&service, "restarting", 1)).unwrap();
        let status = dead[0].status.as_ref().unwrap();
        assert_eq!(status.state, ServiceState::Error);
        assert_eq!(status.exit_code, Some(1));
    }

    #[test]
    fn test_image_label_wins_over_engine_image() {
        let service = web();
        let mut fixture: serde_json::Value =
            serde_json::from_str(&inspect_fixture(&service, "running", 0)).unwrap();
        fixture[0]["Config"]["Image"] = "sha256:4f9c1e".into();
        let parsed = parse_containers(&fixture.to_string()).unwrap();
        assert_eq!(parsed[0].image, "nginx:1.27");

        fixture[0]["Config"]["Labels"]
            .as_object_mut()
            .unwrap()
            .remove("io.edge.image");
        let parsed = parse_containers(&fixture.to_string()).unwrap();
        assert_eq!(parsed[0].image, "sha256:4f9c1e");
    }

    #[test]
    fn test_parse_stats() {
        let line = r#"{"CPUPerc":"12.50%","MemUsage":"10MiB / 1GiB","NetIO":"1.5kB / 2MB","Name":"nginx_10_1"}"#;
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let metrics = parse_stats(line, &web(), at).unwrap();
        assert_eq!(metrics.cpu_percent, 12.5);
        assert_eq!(metrics.memory_usage_bytes, 10 * 1024 * 1024);
        assert_eq!(metrics.memory_limit_bytes, Some(1024 * 1024 * 1024));
        assert_eq!(metrics.network_rx_bytes, 1500);
        assert_eq!(metrics.network_tx_bytes, 2_000_000);
        assert_eq!(parse_size("0B"), Some(0));
        assert_eq!(parse_size("lots"), None);
    }

    #[test]
    fn test_parse_resources_keeps_only_owned() {
        let stdout = concat!(
            r#"{"Name":"1_frontend","Driver":"bridge","Labels":"io.edge.managed=true,io.edge.app-id=1,io.edge.network-name=frontend,tier=web"}"#,
            "\n",
            r#"{"Name":"stray","Driver":"bridge","Labels":"io.edge.managed=true"}"#,
            "\n"
        );
        let parsed = parse_resources(stdout, labels::NETWORK_NAME).unwrap();
        assert_eq!(parsed.len(), 1);
        let (app_id, name, driver, user) = &parsed[0];
        assert_eq!(app_id, "1");
        assert_eq!(name, "frontend");
        assert!(driver.is_none());
        assert_eq!(user.get("tier").map(String::as_str), Some("web"));
    }

    #[test]
    fn test_log_args_and_image_errors() {
        let options = LogOptions {
            follow: true,
            tail: Some(50),
            timestamps: true,
            ..LogOptions::default()
        };
        assert_eq!(
            log_args("abc", &options),
            vec!["logs", "--follow", "--timestamps", "--tail", "50", "abc"]
        );
        assert!(is_image_error("Error response from daemon: manifest unknown"));
        assert!(!is_image_error("port is already allocated"));
    }

    #[cfg(unix)]
    mod engine {
        use super::*;
        use crate::driver::fake_cli::FakeCli;
        use crate::model::{App, TargetState};

        /// Arms answering the read-side commands from files next to the script
        const READS: &str = r#"  'version '*) echo 27.1.0 ;;
  'ps '*) cat "$(dirname "$0")/ids" ;;
  'inspect '*) cat "$(dirname "$0")/inspect.json" ;;
  'network ls '*) cat "$(dirname "$0")/networks" ;;
  'create '*) echo fresh01 ;;"#;

        fn member(id: &str, name: &str, image: &str) -> Service {
            let mut service = Service::new("1", id, name, image);
            service.app_name = "web".into();
            service
        }

        fn container(service: &Service, id: &str, status: &str) -> serde_json::Value {
            serde_json::json!({
                "Id": id,
                "Name": format!("/{}", container_name(service)),
                "State": {
                    "Status": status,
                    "ExitCode": 0,
                    "StartedAt": "2024-05-01T10:00:00Z",
                    "FinishedAt": "0001-01-01T00:00:00Z"
                },
                "Config": { "Image": service.image, "Labels": managed_labels(service) }
            })
        }

        /// Engine holding `containers` and the given `network ls` lines;
        /// `arms` take precedence over the read-side ones
        fn engine(arms: &str, containers: &[serde_json::Value], networks: &str) -> FakeCli {
            let cli = FakeCli::new(&format!("{}\n{}", arms, READS));
            let ids: Vec<&str> = containers.iter().filter_map(|c| c["Id"].as_str()).collect();
            cli.file("ids", &ids.join("\n"));
            cli.file("inspect.json", &serde_json::Value::from(containers.to_vec()).to_string());
            cli.file("networks", networks);
            cli
        }

        async fn connected(cli: &FakeCli) -> DockerDriver {
            let mut driver = DockerDriver::new(DockerConfig::default(), DriverContext::new());
            driver.cli = cli.runner();
            driver.init().await.unwrap();
            driver
        }

        fn target(services: Vec<Service>) -> TargetState {
            let app = services
                .into_iter()
                .fold(App::new("1", "web"), |app, service| app.with_service(service));
            TargetState::default().with_app(app)
        }

        #[test]
        fn test_paused_container_is_unpaused_when_desired_running() {
            smol::block_on(async {
                let api = member("10", "api", "api:1");
                let cli = engine("", &[container(&api, "abc123", "paused")], "");
                let driver = connected(&cli).await;

                driver.set_target_state(target(vec![api])).await.unwrap();
                let result = driver.reconcile().await.unwrap();

                assert!(result.errors.is_empty(), "{:?}", result.errors);
                assert_eq!(result.services_updated, 1);
                assert!(cli.called("unpause abc123"));
                assert!(cli.position("start ").is_none());
            });
        }

        #[test]
        fn test_running_containers_are_stopped_and_paused() {
            smol::block_on(async {
                let api = member("10", "api", "api:1");
                let queue = member("11", "queue", "queue:1");
                let cli = engine(
                    "",
                    &[container(&api, "aaa", "running"), container(&queue, "qqq", "running")],
                    "",
                );
                let driver = connected(&cli).await;

                driver
                    .set_target_state(target(vec![
                        api.with_state(DesiredState::Stopped),
                        queue.with_state(DesiredState::Paused),
                    ]))
                    .await
                    .unwrap();
                let result = driver.reconcile().await.unwrap();

                assert!(result.errors.is_empty(), "{:?}", result.errors);
                assert_eq!(result.services_updated, 2);
                assert!(cli.called("stop -t 10 aaa"));
                assert!(cli.called("pause qqq"));
                assert!(cli.position("rm ").is_none());
            });
        }

        #[test]
        fn test_changed_image_recreates_and_leftovers_are_removed() {
            smol::block_on(async {
                let dropped = member("11", "old", "old:1");
                let site = member("12", "site", "site:1");
                let legacy = r#"{"Name":"1_legacy","Driver":"bridge","Labels":"io.edge.managed=true,io.edge.app-id=1,io.edge.network-name=legacy"}"#;
                let cli = engine(
                    "  'rm -f '*) echo 'Error: No such container: site_12_1' >&2; exit 1 ;;",
                    &[container(&dropped, "old11", "running"), container(&site, "site12", "running")],
                    legacy,
                );
                let driver = connected(&cli).await;

                let mut upgraded = site.clone();
                upgraded.image = "site:2".into();
                driver.set_target_state(target(vec![upgraded])).await.unwrap();
                let result = driver.reconcile().await.unwrap();

                assert!(result.errors.is_empty(), "{:?}", result.errors);
                assert!(result.resource_errors.is_empty());
                assert_eq!(result.services_removed, 1);
                assert_eq!(result.services_updated, 1);

                assert!(cli.called("stop -t 10 old11"));
                assert!(cli.called("rm -v old11"));
                assert!(cli.called("stop -t 10 site12"));
                assert!(cli.called("image inspect site:2"));
                assert!(cli.called("rm -f site_12_1"));
                assert!(cli.called("start fresh01"));
                assert!(cli.called("network rm 1_legacy"));

                let removed = cli.position("rm -v site12").unwrap();
                let created = cli.position("create --name site_12_1").unwrap();
                assert!(removed < created);
            });
        }

        #[test]
        fn test_create_stops_when_leftover_cannot_be_cleared() {
            smol::block_on(async {
                let cli = engine(
                    "  'rm -f '*) echo 'Error response from daemon: removal of container site_12_1 is already in progress' >&2; exit 1 ;;",
                    &[],
                    "",
                );
                let driver = connected(&cli).await;

                let outcome = driver.create_service(&member("12", "site", "site:1")).await;
                match outcome {
                    Err(Error::Backend(message)) => assert!(message.contains("already in progress")),
                    other => panic!("unexpected outcome: {:?}", other),
                }
                assert!(cli.position("create ").is_none());
            });
        }
    }
}
