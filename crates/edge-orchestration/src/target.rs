//! Versioned, atomically swapped target-state handle and target validation.

use crate::model::{App, Probe, TargetState};
use crate::{Error, Result};
use futures::lock::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Immutable target snapshot plus the version it was stored under
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedTargetState {
    /// Monotonically increasing; 0 means nothing was ever submitted
    pub version: u64,
    /// The snapshot
    pub state: TargetState,
}

/// Holder of the active target snapshot.
///
/// Submissions replace the whole snapshot; readers keep whatever `Arc` they
/// took, so a pass that started before a submission keeps seeing the old
/// snapshot until it finishes.
#[derive(Debug)]
pub struct TargetStateHandle {
    current: Mutex<Arc<VersionedTargetState>>,
}

impl Default for TargetStateHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetStateHandle {
    /// Handle holding an empty target at version 0
    pub fn new() -> Self {
        Self {
            current: Mutex::new(Arc::new(VersionedTargetState {
                version: 0,
                state: TargetState::default(),
            })),
        }
    }

    /// Validate and store `state`, returning its version
    pub async fn replace(&self, state: TargetState) -> Result<u64> {
        validate(&state)?;
        let mut current = self.current.lock().await;
        let version = current.version + 1;
        *current = Arc::new(VersionedTargetState { version, state });
        Ok(version)
    }

    /// Active snapshot
    pub async fn snapshot(&self) -> Arc<VersionedTargetState> {
        self.current.lock().await.clone()
    }
}

/// Reject malformed target states before they can become active
pub fn validate(state: &TargetState) -> Result<()> {
    for (key, app) in &state.apps {
        if key != &app.app_id {
            return Err(Error::InvalidTargetState(format!(
                "app stored under '{}' declares app_id '{}'",
                key, app.app_id
            )));
        }
        validate_app(app)?;
    }
    Ok(())
}

fn validate_app(app: &App) -> Result<()> {
    let invalid = |msg: String| Error::InvalidTargetState(format!("app '{}': {}", app.app_id, msg));

    let mut networks = HashSet::new();
    for network in &app.networks {
        if network.name.is_empty() || !networks.insert(network.name.as_str()) {
            return Err(invalid(format!("invalid or duplicate network '{}'", network.name)));
        }
    }

    let mut volumes = HashSet::new();
    for volume in &app.volumes {
        if volume.name.is_empty() || !volumes.insert(volume.name.as_str()) {
            return Err(invalid(format!("invalid or duplicate volume '{}'", volume.name)));
        }
    }

    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    for service in &app.services {
        if service.app_id != app.app_id {
            return Err(invalid(format!(
                "service '{}' belongs to app '{}'",
                service.service_name, service.app_id
            )));
        }
        if service.service_id.is_empty() || !ids.insert(service.service_id.as_str()) {
            return Err(invalid(format!("invalid or duplicate service id '{}'", service.service_id)));
        }
        if service.service_name.is_empty() || !names.insert(service.service_name.as_str()) {
            return Err(invalid(format!(
                "invalid or duplicate service name '{}'",
                service.service_name
            )));
        }
        if service.image.trim().is_empty() {
            return Err(invalid(format!("service '{}' has no image", service.service_name)));
        }

        for network in &service.config.networks {
            if !networks.contains(network.as_str()) {
                return Err(invalid(format!(
                    "service '{}' references undeclared network '{}'",
                    service.service_name, network
                )));
            }
        }
        for mount in &service.config.volumes {
            if !mount.is_bind() && !volumes.contains(mount.source.as_str()) {
                return Err(invalid(format!(
                    "service '{}' references undeclared volume '{}'",
                    service.service_name, mount.source
                )));
            }
        }
        for (kind, probe) in service.config.probes() {
            validate_probe(probe).map_err(|msg| {
                invalid(format!(
                    "service '{}' {:?} probe: {}",
                    service.service_name, kind, msg
                ))
            })?;
        }
    }

    Ok(())
}

fn validate_probe(probe: &Probe) -> std::result::Result<(), String> {
    if probe.period_seconds == 0 {
        return Err("period_seconds must be at least 1".into());
    }
    if probe.timeout_seconds == 0 {
        return Err("timeout_seconds must be at least 1".into());
    }
    if probe.success_threshold == 0 || probe.failure_threshold == 0 {
        return Err("thresholds must be at least 1".into());
    }
    if let crate::model::ProbeHandler::Exec { command } = &probe.handler {
        if command.is_empty() {
            return Err("exec probe needs a command".into());
        }
    }
    Ok(())
}
