//! Driver for a lightweight Kubernetes distribution, driven through `kubectl`.
//!
//! Each app gets its own namespace and each service becomes a single-replica
//! Deployment (scaled to zero when stopped). App volumes become
//! PersistentVolumeClaims. Pod networking is flat, so app networks need no
//! backend object and the network operations succeed without doing anything.

use super::{
    AppResource, CliRunner, CommandOutput, Driver, DriverBase, DriverContext, LogStream,
    desired_from_observed, labels,
};
use crate::{
    Error, Result,
    health::{ProbeOutcome, ProbeRunner, http_probe, tcp_probe},
    model::{
        DesiredState, HealthState, LogOptions, Network, Probe, ProbeHandler, Service,
        ServiceConfig, ServiceError, ServiceErrorKind, ServiceMetrics, ServiceState, ServiceStatus,
        Volume,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Connection options for the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    /// CLI binary
    pub binary: String,
    /// Kubeconfig file; the CLI default when unset
    pub kubeconfig: Option<String>,
    /// Kubeconfig context
    pub context: Option<String>,
    /// Prefix of per-app namespaces
    pub namespace_prefix: String,
    /// Requested size of volume claims
    pub volume_size: String,
    /// Deadline for a single CLI invocation
    pub command_timeout_secs: u64,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            binary: "kubectl".to_string(),
            kubeconfig: None,
            context: None,
            namespace_prefix: "edge-".to_string(),
            volume_size: "1Gi".to_string(),
            command_timeout_secs: 120,
        }
    }
}

impl KubernetesConfig {
    fn runner(&self) -> CliRunner {
        let mut global = Vec::new();
        if let Some(kubeconfig) = &self.kubeconfig {
            global.push(format!("--kubeconfig={}", kubeconfig));
        }
        if let Some(context) = &self.context {
            global.push(format!("--context={}", context));
        }
        CliRunner::new(&self.binary)
            .with_global_args(global)
            .with_timeout(Duration::from_secs(self.command_timeout_secs))
    }
}

/// Lowercase DNS label: alphanumerics and '-', at most 63 characters
pub fn dns_label(raw: &str) -> String {
    let mapped: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let trimmed = mapped.trim_matches('-');
    let mut label: String = trimmed.chars().take(63).collect();
    while label.ends_with('-') {
        label.pop();
    }
    if label.is_empty() { "x".to_string() } else { label }
}

fn deployment_name(service: &Service) -> String {
    dns_label(&format!("{}-{}", service.service_name, service.service_id))
}

/// Driver for the lightweight Kubernetes distribution
pub struct KubernetesDriver {
    base: DriverBase,
    cli: CliRunner,
    config: KubernetesConfig,
}

impl KubernetesDriver {
    /// Create a driver; nothing is contacted until `init`
    pub fn new(config: KubernetesConfig, context: DriverContext) -> Self {
        let cli = config.runner();
        let runner = Arc::new(KubernetesProbeRunner {
            cli: cli.clone(),
            prefix: config.namespace_prefix.clone(),
        });
        Self {
            base: DriverBase::new("k3s", runner, context),
            cli,
            config,
        }
    }

    fn namespace(&self, app_id: &str) -> String {
        namespace_for(&self.config.namespace_prefix, app_id)
    }

    async fn apply(&self, manifest: &Value) -> Result<()> {
        let body = serde_json::to_string(manifest)?;
        let output = self.cli.run_with_stdin(&["apply", "-f", "-"], &body).await?;
        if output.success() {
            Ok(())
        } else {
            Err(Error::Backend(output.message()))
        }
    }

    async fn ensure_namespace(&self, app_id: &str) -> Result<String> {
        let namespace = self.namespace(app_id);
        self.apply(&json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {
                "name": namespace,
                "labels": {
                    (labels::MANAGED): "true",
                    (labels::APP_ID): dns_label(app_id),
                }
            }
        }))
        .await?;
        Ok(namespace)
    }

    async fn scale(&self, service: &Service, replicas: u32) -> Result<()> {
        let namespace = self.namespace(&service.app_id);
        let target = format!("deployment/{}", deployment_name(service));
        let replicas = format!("--replicas={}", replicas);
        let output = self
            .cli
            .run(&["scale", target.as_str(), replicas.as_str(), "-n", namespace.as_str()])
            .await?;
        check_output(service, output)
    }

    async fn get_objects(&self, args: &[&str]) -> Result<Vec<KubeObject>> {
        let mut full = vec!["get"];
        full.extend_from_slice(args);
        full.extend_from_slice(&["-o", "json"]);
        let output = self.cli.run(&full).await?;
        if !output.success() {
            return Err(Error::Backend(output.message()));
        }
        let list: ObjectList = serde_json::from_str(&output.stdout)?;
        Ok(list.items)
    }
}

fn namespace_for(prefix: &str, app_id: &str) -> String {
    dns_label(&format!("{}{}", prefix, app_id))
}

fn check_output(service: &Service, output: CommandOutput) -> Result<()> {
    if output.success() {
        return Ok(());
    }
    let message = output.message();
    if message.contains("NotFound") || message.contains("not found") {
        Err(Error::ServiceNotFound(deployment_name(service)))
    } else {
        Err(Error::Backend(message))
    }
}

#[async_trait]
impl Driver for KubernetesDriver {
    fn base(&self) -> &DriverBase {
        &self.base
    }

    async fn init(&self) -> Result<()> {
        let output = self
            .cli
            .run(&["version", "-o", "json"])
            .await
            .map_err(|e| Error::BackendUnreachable(e.to_string()))?;
        if !output.success() {
            return Err(Error::BackendUnreachable(output.message()));
        }
        info!("Connected to cluster API");
        self.base.mark_ready();
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.base.shutdown().await;
        Ok(())
    }

    async fn create_service(&self, service: &Service) -> Result<String> {
        self.base.ensure_ready()?;
        self.base.log_action("Creating", service);
        let namespace = self.ensure_namespace(&service.app_id).await?;
        let manifest = deployment_manifest(service, &namespace)?;
        self.apply(&manifest).await?;
        Ok(deployment_name(service))
    }

    async fn start_service(&self, service: &Service) -> Result<()> {
        self.base.ensure_ready()?;
        self.base.log_action("Starting", service);
        self.scale(service, 1).await.map_err(|e| match e {
            Error::Backend(message) => Error::StartFailure {
                service: service.service_name.clone(),
                message,
            },
            other => other,
        })
    }

    async fn stop_service(&self, service: &Service, _timeout: Duration) -> Result<()> {
        self.base.ensure_ready()?;
        self.base.log_action("Stopping", service);
        self.scale(service, 0).await
    }

    async fn remove_service(&self, service: &Service, force: bool) -> Result<()> {
        self.base.ensure_ready()?;
        self.base.log_action("Removing", service);
        let namespace = self.namespace(&service.app_id);
        let name = deployment_name(service);
        let mut args = vec![
            "delete",
            "deployment",
            name.as_str(),
            "-n",
            namespace.as_str(),
            "--ignore-not-found",
            "--wait=false",
        ];
        if force {
            args.extend_from_slice(&["--grace-period=0", "--force"]);
        }
        let output = self.cli.run(&args).await?;
        check_output(service, output)
    }

    async fn restart_service(&self, service: &Service, _timeout: Duration) -> Result<()> {
        self.base.ensure_ready()?;
        self.base.log_action("Restarting", service);
        let namespace = self.namespace(&service.app_id);
        let target = format!("deployment/{}", deployment_name(service));
        let output = self
            .cli
            .run(&["rollout", "restart", target.as_str(), "-n", namespace.as_str()])
            .await?;
        check_output(service, output)
    }

    async fn get_service_status(&self, service: &Service) -> Result<ServiceStatus> {
        self.base.ensure_ready()?;
        let namespace = self.namespace(&service.app_id);
        let selector = format!("{}={}", labels::SERVICE_ID, dns_label(&service.service_id));
        let objects = self
            .get_objects(&["deployments,pods", "-n", namespace.as_str(), "-l", selector.as_str()])
            .await?;
        services_from_objects(objects, self.base.clock().now())
            .into_iter()
            .find(|s| s.key() == service.key())
            .and_then(|s| s.status)
            .ok_or_else(|| Error::ServiceNotFound(deployment_name(service)))
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        self.base.ensure_ready()?;
        let selector = format!("{}=true", labels::MANAGED);
        let objects = self
            .get_objects(&["deployments,pods", "-A", "-l", selector.as_str()])
            .await
            .map_err(|e| match e {
                Error::Backend(message) => Error::BackendUnreachable(message),
                other => other,
            })?;
        Ok(services_from_objects(objects, self.base.clock().now()))
    }

    async fn exec_in_service(&self, service: &Service, command: &[String]) -> Result<CommandOutput> {
        self.base.ensure_ready()?;
        let args = exec_args(&self.namespace(&service.app_id), service, command);
        self.cli.run(&args).await
    }

    async fn get_service_logs(&self, service: &Service, options: &LogOptions) -> Result<LogStream> {
        self.base.ensure_ready()?;
        let args = log_args(&self.namespace(&service.app_id), service, options);
        self.cli.stream_lines(&args, options.timestamps)
    }

    async fn get_service_metrics(&self, service: &Service) -> Result<ServiceMetrics> {
        self.base.ensure_ready()?;
        let namespace = self.namespace(&service.app_id);
        let selector = format!("{}={}", labels::SERVICE_ID, dns_label(&service.service_id));
        let stdout = self
            .cli
            .run_checked(&[
                "top",
                "pod",
                "-n",
                namespace.as_str(),
                "-l",
                selector.as_str(),
                "--no-headers",
            ])
            .await?;
        parse_top(&stdout, service, self.base.clock().now())
            .ok_or_else(|| Error::ServiceNotFound(deployment_name(service)))
    }

    async fn create_network(&self, app_id: &str, network: &Network) -> Result<()> {
        debug!(
            "Network '{}' of app {} needs no cluster object",
            network.name, app_id
        );
        Ok(())
    }

    async fn remove_network(&self, _app_id: &str, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<AppResource<Network>>> {
        Ok(Vec::new())
    }

    async fn create_volume(&self, app_id: &str, volume: &Volume) -> Result<()> {
        self.base.ensure_ready()?;
        let namespace = self.ensure_namespace(app_id).await?;
        self.apply(&claim_manifest(app_id, volume, &namespace, &self.config.volume_size))
            .await
    }

    async fn remove_volume(&self, app_id: &str, name: &str) -> Result<()> {
        self.base.ensure_ready()?;
        let namespace = self.namespace(app_id);
        let claim = dns_label(name);
        self.cli
            .run_checked(&[
                "delete",
                "pvc",
                claim.as_str(),
                "-n",
                namespace.as_str(),
                "--ignore-not-found",
                "--wait=false",
            ])
            .await
            .map(|_| ())
    }

    async fn list_volumes(&self) -> Result<Vec<AppResource<Volume>>> {
        self.base.ensure_ready()?;
        let selector = format!("{}=true", labels::MANAGED);
        let objects = self
            .get_objects(&["pvc", "-A", "-l", selector.as_str()])
            .await?;
        Ok(volumes_from_objects(objects))
    }
}

/// Probes against pods: pod IP for HTTP/TCP, `kubectl exec` otherwise
struct KubernetesProbeRunner {
    cli: CliRunner,
    prefix: String,
}

impl KubernetesProbeRunner {
    async fn pod_ip(&self, service: &Service) -> Option<String> {
        let namespace = namespace_for(&self.prefix, &service.app_id);
        let selector = format!("{}={}", labels::SERVICE_ID, dns_label(&service.service_id));
        let ip = self
            .cli
            .run_checked(&[
                "get",
                "pods",
                "-n",
                namespace.as_str(),
                "-l",
                selector.as_str(),
                "--field-selector=status.phase=Running",
                "-o",
                "jsonpath={.items[0].status.podIP}",
            ])
            .await
            .ok()?;
        let ip = ip.trim();
        (!ip.is_empty()).then(|| ip.to_string())
    }
}

#[async_trait]
impl ProbeRunner for KubernetesProbeRunner {
    async fn run_probe(&self, service: &Service, probe: &Probe) -> ProbeOutcome {
        match &probe.handler {
            ProbeHandler::Exec { command } => {
                let namespace = namespace_for(&self.prefix, &service.app_id);
                match self.cli.run(&exec_args(&namespace, service, command)).await {
                    Ok(output) if output.success() => ProbeOutcome::Success,
                    Ok(output) => ProbeOutcome::Failure(format!(
                        "exit code {:?}: {}",
                        output.code,
                        output.message()
                    )),
                    Err(e) => ProbeOutcome::Failure(e.to_string()),
                }
            }
            ProbeHandler::Tcp { port } => match self.pod_ip(service).await {
                Some(ip) => tcp_probe(&ip, *port).await,
                None => ProbeOutcome::Failure("no running pod".to_string()),
            },
            ProbeHandler::Http { path, port } => match self.pod_ip(service).await {
                Some(ip) => http_probe(&ip, *port, path).await,
                None => ProbeOutcome::Failure("no running pod".to_string()),
            },
        }
    }
}

fn exec_args(namespace: &str, service: &Service, command: &[String]) -> Vec<String> {
    let mut args = vec![
        "exec".to_string(),
        "-n".to_string(),
        namespace.to_string(),
        format!("deployment/{}", deployment_name(service)),
        "--".to_string(),
    ];
    args.extend(command.iter().cloned());
    args
}

fn log_args(namespace: &str, service: &Service, options: &LogOptions) -> Vec<String> {
    let mut args = vec![
        "logs".to_string(),
        "-n".to_string(),
        namespace.to_string(),
        format!("deployment/{}", deployment_name(service)),
    ];
    if options.follow {
        args.push("--follow".to_string());
    }
    if options.timestamps {
        args.push("--timestamps".to_string());
    }
    if let Some(tail) = options.tail {
        args.push(format!("--tail={}", tail));
    }
    if let Some(since) = options.since {
        args.push(format!("--since-time={}", since.to_rfc3339()));
    }
    args
}

fn identity_labels(service: &Service) -> Value {
    json!({
        (labels::MANAGED): "true",
        (labels::APP_ID): dns_label(&service.app_id),
        (labels::SERVICE_ID): dns_label(&service.service_id),
    })
}

/// Deployment manifest for a service
pub fn deployment_manifest(service: &Service, namespace: &str) -> Result<Value> {
    let config = &service.config;
    let replicas = u32::from(service.state == DesiredState::Running);

    let env: Vec<Value> = config
        .environment
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();
    let ports: Vec<Value> = config
        .ports
        .iter()
        .map(|port| {
            json!({
                "containerPort": port.container_port,
                "hostPort": port.host_port,
                "protocol": port.protocol.to_string().to_uppercase(),
            })
        })
        .collect();

    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    for (index, mount) in config.volumes.iter().enumerate() {
        let name = format!("vol-{}", index);
        if mount.is_bind() {
            volumes.push(json!({ "name": name, "hostPath": { "path": mount.source } }));
        } else {
            volumes.push(json!({
                "name": name,
                "persistentVolumeClaim": { "claimName": dns_label(&mount.source) }
            }));
        }
        mounts.push(json!({
            "name": name,
            "mountPath": mount.target,
            "readOnly": mount.read_only,
        }));
    }

    let mut limits = serde_json::Map::new();
    if let Some(cpu) = config.resources.cpu_millis {
        limits.insert("cpu".to_string(), json!(format!("{}m", cpu)));
    }
    if let Some(memory) = config.resources.memory_bytes {
        limits.insert("memory".to_string(), json!(memory.to_string()));
    }

    let mut container = json!({
        "name": dns_label(&service.service_name),
        "image": service.image,
        "env": env,
        "ports": ports,
        "volumeMounts": mounts,
        "resources": { "limits": limits },
    });
    if !config.command.is_empty() {
        container["command"] = json!(config.command);
    }

    let mut pod_labels = identity_labels(service);
    for (key, value) in &config.labels {
        pod_labels[key.as_str()] = json!(value);
    }

    Ok(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": deployment_name(service),
            "namespace": namespace,
            "labels": identity_labels(service),
            "annotations": {
                (labels::APP_ID): service.app_id,
                (labels::APP_NAME): service.app_name,
                (labels::SERVICE_ID): service.service_id,
                (labels::SERVICE_NAME): service.service_name,
                (labels::IMAGE): service.image,
                (labels::SERVICE_CONFIG): serde_json::to_string(config)?,
            }
        },
        "spec": {
            "replicas": replicas,
            "strategy": { "type": "Recreate" },
            "selector": {
                "matchLabels": {
                    (labels::APP_ID): dns_label(&service.app_id),
                    (labels::SERVICE_ID): dns_label(&service.service_id),
                }
            },
            "template": {
                "metadata": { "labels": pod_labels },
                "spec": {
                    "containers": [container],
                    "volumes": volumes,
                }
            }
        }
    }))
}

fn claim_manifest(app_id: &str, volume: &Volume, namespace: &str, size: &str) -> Value {
    let mut claim_labels = json!({
        (labels::MANAGED): "true",
        (labels::APP_ID): dns_label(app_id),
        (labels::VOLUME_NAME): dns_label(&volume.name),
    });
    for (key, value) in &volume.labels {
        claim_labels[key.as_str()] = json!(value);
    }
    let mut spec = json!({
        "accessModes": ["ReadWriteOnce"],
        "resources": { "requests": { "storage": size } },
    });
    if let Some(class) = &volume.driver {
        spec["storageClassName"] = json!(class);
    }
    json!({
        "apiVersion": "v1",
        "kind": "PersistentVolumeClaim",
        "metadata": {
            "name": dns_label(&volume.name),
            "namespace": namespace,
            "labels": claim_labels,
            "annotations": {
                (labels::APP_ID): app_id,
                (labels::VOLUME_NAME): volume.name,
            }
        },
        "spec": spec,
    })
}

#[derive(Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<KubeObject>,
}

#[derive(Deserialize)]
struct KubeObject {
    kind: String,
    metadata: ObjectMeta,
    #[serde(default)]
    spec: Value,
    #[serde(default)]
    status: Value,
}

#[derive(Deserialize)]
struct ObjectMeta {
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(default)]
    annotations: HashMap<String, String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
    #[serde(default)]
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerStatus {
    #[serde(default)]
    restart_count: u32,
    #[serde(default)]
    state: ContainerState,
}

#[derive(Deserialize, Default)]
struct ContainerState {
    running: Option<RunningState>,
    waiting: Option<WaitingState>,
    terminated: Option<TerminatedState>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunningState {
    started_at: Option<String>,
}

#[derive(Deserialize)]
struct WaitingState {
    reason: Option<String>,
    message: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminatedState {
    #[serde(default)]
    exit_code: i64,
    started_at: Option<String>,
    finished_at: Option<String>,
}

fn parse_time(raw: Option<&str>) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Classification of a pod waiting reason
pub fn error_kind_for_reason(reason: &str) -> Option<ServiceErrorKind> {
    match reason {
        "ErrImagePull" | "InvalidImageName" => Some(ServiceErrorKind::ErrImagePull),
        "ImagePullBackOff" => Some(ServiceErrorKind::ImagePullBackOff),
        "CrashLoopBackOff" => Some(ServiceErrorKind::CrashLoopBackOff),
        "CreateContainerError" | "CreateContainerConfigError" | "RunContainerError" => {
            Some(ServiceErrorKind::StartFailure)
        }
        _ => None,
    }
}

fn pod_status(
    replicas: u32,
    pod: Option<&PodStatus>,
    now: DateTime<Utc>,
) -> (ServiceStatus, Option<ServiceError>) {
    if replicas == 0 {
        return (ServiceStatus::new(ServiceState::Stopped), None);
    }
    let Some(container) = pod.and_then(|p| p.container_statuses.first()) else {
        return (ServiceStatus::new(ServiceState::Creating), None);
    };

    let mut status = ServiceStatus {
        restart_count: container.restart_count,
        ..ServiceStatus::default()
    };
    let mut error = None;
    let state = &container.state;

    if let Some(running) = &state.running {
        status.state = ServiceState::Running;
        status.started_at = parse_time(running.started_at.as_deref());
    } else if let Some(waiting) = &state.waiting {
        let reason = waiting.reason.as_deref().unwrap_or_default();
        match error_kind_for_reason(reason) {
            Some(kind) => {
                status.state = ServiceState::Error;
                error = Some(ServiceError {
                    kind,
                    message: waiting.message.clone().unwrap_or_else(|| reason.to_string()),
                    timestamp: now,
                    retry_count: container.restart_count,
                    next_retry: None,
                });
            }
            None => status.state = ServiceState::Creating,
        }
    } else if let Some(terminated) = &state.terminated {
        status.state = if terminated.exit_code == 0 {
            ServiceState::Stopped
        } else {
            ServiceState::Error
        };
        status.exit_code = Some(terminated.exit_code);
        status.started_at = parse_time(terminated.started_at.as_deref());
        status.finished_at = parse_time(terminated.finished_at.as_deref());
    } else {
        status.state = ServiceState::Unknown;
    }
    status.health = HealthState::Unknown;
    (status, error)
}

/// Build observed services from a list of Deployments and their Pods
fn services_from_objects(objects: Vec<KubeObject>, now: DateTime<Utc>) -> Vec<Service> {
    let mut pods: HashMap<(String, String), PodStatus> = HashMap::new();
    let mut deployments = Vec::new();
    for object in objects {
        match object.kind.as_str() {
            "Pod" => {
                let key = (
                    object.metadata.labels.get(labels::APP_ID).cloned().unwrap_or_default(),
                    object.metadata.labels.get(labels::SERVICE_ID).cloned().unwrap_or_default(),
                );
                let status: PodStatus = serde_json::from_value(object.status).unwrap_or_default();
                // Prefer a pod that reports a running container
                let running = status
                    .container_statuses
                    .first()
                    .is_some_and(|c| c.state.running.is_some());
                if running || !pods.contains_key(&key) {
                    pods.insert(key, status);
                }
            }
            "Deployment" => deployments.push(object),
            _ => {}
        }
    }

    let mut services = Vec::new();
    for deployment in deployments {
        let notes = &deployment.metadata.annotations;
        let (Some(app_id), Some(service_id)) = (notes.get(labels::APP_ID), notes.get(labels::SERVICE_ID)) else {
            warn!("Managed deployment without identity annotations");
            continue;
        };
        let config = notes
            .get(labels::SERVICE_CONFIG)
            .and_then(|raw| serde_json::from_str::<ServiceConfig>(raw).ok())
            .unwrap_or_default();
        let replicas = deployment
            .spec
            .get("replicas")
            .and_then(Value::as_u64)
            .unwrap_or(1) as u32;
        let pod_key = (dns_label(app_id), dns_label(service_id));
        let (status, error) = pod_status(replicas, pods.get(&pod_key), now);

        services.push(Service {
            service_id: service_id.clone(),
            service_name: notes.get(labels::SERVICE_NAME).cloned().unwrap_or_default(),
            app_id: app_id.clone(),
            app_name: notes.get(labels::APP_NAME).cloned().unwrap_or_default(),
            image: notes.get(labels::IMAGE).cloned().unwrap_or_default(),
            state: desired_from_observed(status.state),
            config,
            instance_id: Some(deployment_name_from(notes)),
            status: Some(status),
            error,
        });
    }
    services
}

fn deployment_name_from(notes: &HashMap<String, String>) -> String {
    let name = notes.get(labels::SERVICE_NAME).map(String::as_str).unwrap_or_default();
    let id = notes.get(labels::SERVICE_ID).map(String::as_str).unwrap_or_default();
    dns_label(&format!("{}-{}", name, id))
}

fn volumes_from_objects(objects: Vec<KubeObject>) -> Vec<AppResource<Volume>> {
    objects
        .into_iter()
        .filter(|o| o.kind == "PersistentVolumeClaim")
        .filter_map(|o| {
            let notes = o.metadata.annotations;
            let app_id = notes.get(labels::APP_ID)?.clone();
            let name = notes.get(labels::VOLUME_NAME)?.clone();
            let driver = o
                .spec
                .get("storageClassName")
                .and_then(Value::as_str)
                .map(String::from);
            let user: BTreeMap<String, String> = o
                .metadata
                .labels
                .into_iter()
                .filter(|(k, _)| !k.starts_with("io.edge."))
                .collect();
            Some((
                app_id,
                Volume {
                    name,
                    driver,
                    labels: user,
                },
            ))
        })
        .collect()
}

/// Parse a quantity such as `250m` cores or `64Mi` bytes
fn parse_quantity(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    let value: f64 = number.parse().ok()?;
    if suffix == "m" {
        return Some(value / 1000.0);
    }
    let factor = match suffix {
        "" => 1.0,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some(value * factor)
}

/// Parse `kubectl top pod --no-headers` output (first pod wins)
fn parse_top(stdout: &str, service: &Service, timestamp: DateTime<Utc>) -> Option<ServiceMetrics> {
    let line = stdout.lines().find(|l| !l.trim().is_empty())?;
    let mut columns = line.split_whitespace().skip(1);
    let cores = parse_quantity(columns.next()?)?;
    let memory = parse_quantity(columns.next()?)?;
    Some(ServiceMetrics {
        app_id: service.app_id.clone(),
        service_name: service.service_name.clone(),
        cpu_percent: cores * 100.0,
        memory_usage_bytes: memory as u64,
        memory_limit_bytes: service.config.resources.memory_bytes,
        network_rx_bytes: 0,
        network_tx_bytes: 0,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PortMapping, Protocol, ResourceLimits, VolumeMount};

    fn worker() -> Service {
        let mut service = Service::new("App_1", "42", "Queue Worker", "worker:2")
            .with_state(DesiredState::Stopped)
            .with_config(ServiceConfig {
                command: vec!["run".into(), "--fast".into()],
                ports: vec![PortMapping {
                    host_port: 9000,
                    container_port: 9000,
                    protocol: Protocol::Udp,
                }],
                volumes: vec![VolumeMount {
                    source: "cache".into(),
                    target: "/cache".into(),
                    read_only: false,
                }],
                resources: ResourceLimits {
                    cpu_millis: Some(250),
                    memory_bytes: None,
                },
                ..ServiceConfig::default()
            });
        service.app_name = "jobs".into();
        service
    }

    #[test]
    fn test_dns_label() {
        assert_eq!(dns_label("Queue Worker-42"), "queue-worker-42");
        assert_eq!(dns_label("--x--"), "x");
        assert_eq!(dns_label("!!!"), "x");
        assert_eq!(dns_label(&"a".repeat(80)).len(), 63);
    }

    #[test]
    fn test_deployment_manifest() {
        let manifest = deployment_manifest(&worker(), "edge-app-1").unwrap();
        assert_eq!(manifest["metadata"]["name"], "queue-worker-42");
        assert_eq!(manifest["spec"]["replicas"], 0);
        assert_eq!(manifest["metadata"]["labels"]["io.edge.app-id"], "app-1");
        assert_eq!(manifest["metadata"]["annotations"]["io.edge.app-id"], "App_1");

        let container = &manifest["spec"]["template"]["spec"]["containers"][0];
        assert_eq!(container["image"], "worker:2");
        assert_eq!(container["command"][1], "--fast");
        assert_eq!(container["ports"][0]["protocol"], "UDP");
        assert_eq!(container["resources"]["limits"]["cpu"], "250m");
        assert_eq!(
            manifest["spec"]["template"]["spec"]["volumes"][0]["persistentVolumeClaim"]["claimName"],
            "cache"
        );
    }

    #[test]
    fn test_services_from_objects_round_trip() {
        let mut running = worker().with_state(DesiredState::Running);
        running.config.command.clear();
        let deployment = deployment_manifest(&running, "edge-app-1").unwrap();
        let pod = json!({
            "kind": "Pod",
            "metadata": { "labels": identity_labels(&running) },
            "status": {
                "containerStatuses": [{
                    "restartCount": 4,
                    "state": { "running": { "startedAt": "2024-05-01T10:00:00Z" } }
                }]
            }
        });
        let list = json!({ "items": [deployment, pod] });
        let parsed: ObjectList = serde_json::from_value(list).unwrap();
        let services = services_from_objects(parsed.items, Utc::now());

        assert_eq!(services.len(), 1);
        let observed = &services[0];
        assert!(observed.same_definition(&running));
        let status = observed.status.as_ref().unwrap();
        assert_eq!(status.state, ServiceState::Running);
        assert_eq!(status.restart_count, 4);
        assert!(observed.error.is_none());
    }

    #[test]
    fn test_waiting_reasons_map_to_errors() {
        let pod: PodStatus = serde_json::from_value(json!({
            "containerStatuses": [{
                "restartCount": 6,
                "state": { "waiting": { "reason": "CrashLoopBackOff", "message": "back-off 5m0s" } }
            }]
        }))
        .unwrap();
        let (status, error) = pod_status(1, Some(&pod), Utc::now());
        assert_eq!(status.state, ServiceState::Error);
        let error = error.unwrap();
        assert_eq!(error.kind, ServiceErrorKind::CrashLoopBackOff);
        assert_eq!(error.message, "back-off 5m0s");

        let (stopped, _) = pod_status(0, Some(&pod), Utc::now());
        assert_eq!(stopped.state, ServiceState::Stopped);
        let (pending, _) = pod_status(1, None, Utc::now());
        assert_eq!(pending.state, ServiceState::Creating);
        assert_eq!(error_kind_for_reason("ContainerCreating"), None);
    }

    #[test]
    fn test_parse_top() {
        let metrics = parse_top("queue-worker-42-abc   250m   64Mi\n", &worker(), Utc::now()).unwrap();
        assert_eq!(metrics.cpu_percent, 25.0);
        assert_eq!(metrics.memory_usage_bytes, 64 * 1024 * 1024);
        assert!(parse_top("", &worker(), Utc::now()).is_none());
    }

    #[test]
    fn test_log_args() {
        let options = LogOptions {
            tail: Some(10),
            ..LogOptions::default()
        };
        let args = log_args("edge-1", &worker(), &options);
        assert_eq!(
            args,
            vec!["logs", "-n", "edge-1", "deployment/queue-worker-42", "--tail=10"]
        );
    }

    #[cfg(unix)]
    mod cluster {
        use super::*;
        use crate::clock::ManualClock;
        use crate::driver::fake_cli::FakeCli;
        use crate::model::{App, TargetState};
        use chrono::TimeZone;

        const READS: &str = r#"  'version '*) echo '{}' ;;
  'get deployments,pods '*) cat "$(dirname "$0")/objects.json" ;;
  'get pvc '*) echo '{"items":[]}' ;;"#;

        fn member(id: &str, name: &str, image: &str) -> Service {
            let mut service = Service::new("1", id, name, image);
            service.app_name = "web".into();
            service
        }

        fn deployment(service: &Service, state: DesiredState) -> Value {
            deployment_manifest(&service.clone().with_state(state), "edge-1").unwrap()
        }

        fn pod(service: &Service, state: Value) -> Value {
            json!({
                "kind": "Pod",
                "metadata": { "labels": identity_labels(service) },
                "status": { "containerStatuses": [{ "restartCount": 4, "state": state }] }
            })
        }

        fn running_pod(service: &Service) -> Value {
            pod(service, json!({ "running": { "startedAt": "2024-05-01T10:00:00Z" } }))
        }

        fn cluster(objects: Vec<Value>) -> FakeCli {
            let cli = FakeCli::new(READS);
            cli.file("objects.json", &json!({ "items": objects }).to_string());
            cli
        }

        async fn connected(cli: &FakeCli, context: DriverContext) -> KubernetesDriver {
            let mut driver = KubernetesDriver::new(KubernetesConfig::default(), context);
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
        fn test_state_changes_scale_the_deployment() {
            smol::block_on(async {
                let api = member("10", "api", "api:1");
                let queue = member("11", "queue", "queue:1");
                let cli = cluster(vec![
                    deployment(&api, DesiredState::Stopped),
                    deployment(&queue, DesiredState::Running),
                    running_pod(&queue),
                ]);
                let driver = connected(&cli, DriverContext::new()).await;

                driver
                    .set_target_state(target(vec![api, queue.with_state(DesiredState::Stopped)]))
                    .await
                    .unwrap();
                let result = driver.reconcile().await.unwrap();

                assert!(result.errors.is_empty(), "{:?}", result.errors);
                assert_eq!(result.services_updated, 2);
                assert!(cli.called("scale deployment/api-10 --replicas=1 -n edge-1"));
                assert!(cli.called("scale deployment/queue-11 --replicas=0 -n edge-1"));
                assert!(cli.position("delete ").is_none());
            });
        }

        #[test]
        fn test_recreate_and_dropped_deployment_cleanup() {
            smol::block_on(async {
                let dropped = member("11", "old", "old:1");
                let site = member("12", "site", "site:1");
                let cli = cluster(vec![
                    deployment(&dropped, DesiredState::Running),
                    running_pod(&dropped),
                    deployment(&site, DesiredState::Running),
                    running_pod(&site),
                ]);
                let driver = connected(&cli, DriverContext::new()).await;

                let mut upgraded = site.clone();
                upgraded.image = "site:2".into();
                driver.set_target_state(target(vec![upgraded])).await.unwrap();
                let result = driver.reconcile().await.unwrap();

                assert!(result.errors.is_empty(), "{:?}", result.errors);
                assert_eq!(result.services_removed, 1);
                assert_eq!(result.services_updated, 1);

                assert!(cli.called("scale deployment/old-11 --replicas=0 -n edge-1"));
                assert!(cli.called("delete deployment old-11 -n edge-1 --ignore-not-found --wait=false"));
                let deleted = cli
                    .position("delete deployment site-12 -n edge-1")
                    .unwrap();
                let applied = cli.calls().iter().rposition(|c| c == "apply -f -").unwrap();
                assert!(deleted < applied);
            });
        }

        #[test]
        fn test_restart_rolls_out_and_pause_is_unsupported() {
            smol::block_on(async {
                let api = member("10", "api", "api:1");
                let cli = cluster(Vec::new());
                let driver = connected(&cli, DriverContext::new()).await;

                driver
                    .restart_service(&api, Duration::from_secs(10))
                    .await
                    .unwrap();
                assert!(cli.called("rollout restart deployment/api-10 -n edge-1"));

                match driver.pause_service(&api).await {
                    Err(Error::Unsupported { operation, .. }) => assert_eq!(operation, "pause_service"),
                    other => panic!("unexpected outcome: {:?}", other),
                }
            });
        }

        #[test]
        fn test_pod_errors_are_stamped_with_driver_clock() {
            smol::block_on(async {
                let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
                let context = DriverContext::new().with_clock(Arc::new(ManualClock::new(at)));
                let api = member("10", "api", "api:1");
                let cli = cluster(vec![
                    deployment(&api, DesiredState::Running),
                    pod(
                        &api,
                        json!({ "waiting": { "reason": "CrashLoopBackOff", "message": "back-off 5m0s" } }),
                    ),
                ]);
                let driver = connected(&cli, context).await;

                let services = driver.list_services().await.unwrap();
                assert_eq!(services.len(), 1);
                let error = services[0].error.as_ref().unwrap();
                assert_eq!(error.kind, ServiceErrorKind::CrashLoopBackOff);
                assert_eq!(error.timestamp, at);
            });
        }
    }
}
