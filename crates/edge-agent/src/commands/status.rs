use super::{connect, select_backend};
use crate::config::AgentConfig;
use crate::source::load_target;
use anyhow::Result;

pub async fn run(config: &AgentConfig) -> Result<()> {
    // The target only matters here for picking the backend
    let target = load_target(&config.target_path).ok();
    let backend = select_backend(config, target.as_ref());
    let engine = connect(config, backend).await?;

    let state = engine.current_state().await;
    engine.shutdown(config.shutdown_grace()).await?;

    print!("{}", serde_yaml::to_string(&state?)?);
    Ok(())
}
