pub mod reconcile;
pub mod run;
pub mod status;
pub mod validate;

use crate::config::AgentConfig;
use anyhow::{Context, Result};
use edge_orchestration::{
    BackendKind, DockerDriver, Driver, DriverContext, KubernetesDriver, ReconciliationEngine,
    TargetState,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Engine over whichever backend the host runs
pub type Engine = ReconciliationEngine<dyn Driver>;

/// Backend to drive: the configured one, else the target's choice
pub fn select_backend(config: &AgentConfig, target: Option<&TargetState>) -> BackendKind {
    config
        .backend
        .or_else(|| target.map(|t| t.settings.backend))
        .unwrap_or_default()
}

/// Driver for `backend` built from the agent configuration
pub fn build_driver(config: &AgentConfig, backend: BackendKind) -> Arc<dyn Driver> {
    let context = DriverContext::new().with_shutdown_grace(config.shutdown_grace());
    match backend {
        BackendKind::Docker => Arc::new(DockerDriver::new(config.docker.clone(), context)),
        BackendKind::K3s => Arc::new(KubernetesDriver::new(config.kubernetes.clone(), context)),
    }
}

/// Build the engine and bring the driver up
pub async fn connect(config: &AgentConfig, backend: BackendKind) -> Result<Engine> {
    let engine: Engine = ReconciliationEngine::new(build_driver(config, backend), config.engine_config());
    engine
        .init()
        .await
        .with_context(|| format!("Failed to initialize the {} backend", backend))?;
    info!(backend = %backend, "Backend ready");
    Ok(engine)
}

/// Hand a new target to the engine, keeping the previous one if it is rejected
pub async fn submit(engine: &Engine, backend: BackendKind, target: TargetState) -> Option<u64> {
    if target.settings.backend != backend {
        warn!(
            requested = %target.settings.backend,
            active = %backend,
            "Target state selects another backend; restart the agent to switch"
        );
    }
    match engine.set_target_state(target).await {
        Ok(version) => {
            info!(version, "Target state accepted");
            Some(version)
        }
        Err(e) => {
            warn!(error = %e, "Target state rejected; keeping the previous one");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_orchestration::Settings;

    fn target_on(backend: BackendKind) -> TargetState {
        TargetState {
            settings: Settings {
                backend,
                ..Settings::default()
            },
            ..TargetState::default()
        }
    }

    #[test]
    fn test_backend_selection_order() {
        let mut config = AgentConfig::default();
        assert_eq!(select_backend(&config, None), BackendKind::Docker);
        assert_eq!(
            select_backend(&config, Some(&target_on(BackendKind::K3s))),
            BackendKind::K3s
        );

        config.backend = Some(BackendKind::Docker);
        assert_eq!(
            select_backend(&config, Some(&target_on(BackendKind::K3s))),
            BackendKind::Docker
        );
    }

    #[test]
    fn test_driver_matches_backend() {
        let config = AgentConfig::default();
        assert_eq!(build_driver(&config, BackendKind::Docker).base().name(), "docker");
        assert_eq!(build_driver(&config, BackendKind::K3s).base().name(), "k3s");
    }
}
