use crate::source::load_target;
use anyhow::{Context, Result};
use edge_orchestration::target;
use std::path::Path;

pub async fn run(path: &Path) -> Result<()> {
    println!("Validating {}...", path.display());

    let state = load_target(path)?;
    target::validate(&state).context("Target state is invalid")?;

    println!("✓ Target state valid");
    println!("  Backend: {}", state.settings.backend);
    println!("  Poll interval: {}ms", state.settings.poll_interval_ms);
    println!("  Apps: {}", state.apps.len());
    for app in state.apps.values() {
        println!(
            "    {} ({}): {} services, {} networks, {} volumes",
            app.app_id,
            app.app_name,
            app.services.len(),
            app.networks.len(),
            app.volumes.len()
        );
    }

    let enabled: Vec<&str> = state
        .settings
        .feature_flags
        .iter()
        .filter(|(_, on)| **on)
        .map(|(flag, _)| flag.as_str())
        .collect();
    if !enabled.is_empty() {
        println!("  Feature flags: {}", enabled.join(", "));
    }

    Ok(())
}
