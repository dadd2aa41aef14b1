use super::{connect, select_backend};
use crate::config::AgentConfig;
use crate::source::load_target;
use anyhow::{Context, Result, bail};
use edge_orchestration::PassOutcome;

pub async fn run(config: &AgentConfig) -> Result<()> {
    let target = load_target(&config.target_path)?;
    let backend = select_backend(config, Some(&target));
    let engine = connect(config, backend).await?;

    let outcome = async {
        engine
            .set_target_state(target)
            .await
            .context("Target state rejected")?;
        Ok::<_, anyhow::Error>(engine.reconcile_once().await?)
    }
    .await;
    // Release the backend even when the pass failed
    engine.shutdown(config.shutdown_grace()).await?;

    match outcome? {
        PassOutcome::Completed(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.errors.is_empty() || !result.resource_errors.is_empty() {
                eprintln!(
                    "⚠ {} service and {} resource operations failed",
                    result.errors.len(),
                    result.resource_errors.len()
                );
            }
            Ok(())
        }
        PassOutcome::Skipped(reason) => bail!("Reconciliation skipped: {:?}", reason),
    }
}
