use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use edge_orchestration::BackendKind;
use std::path::PathBuf;

mod commands;
mod config;
mod logging;
mod source;

use config::{AgentConfig, LogFormat};

#[derive(Parser)]
#[command(name = "edge-agent")]
#[command(about = "Edge agent - keeps local container workloads converged on a target state")]
#[command(version)]
struct Cli {
    /// Agent configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Target-state file, overriding the configuration
    #[arg(short, long, global = true)]
    target: Option<PathBuf>,

    /// Orchestration backend, overriding configuration and target state
    #[arg(short, long, global = true, value_enum)]
    backend: Option<BackendArg>,

    /// Log filter when RUST_LOG is not set
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log line format
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Keep reconciling the target state until interrupted
    Run,

    /// Run a single reconciliation pass and print its result as JSON
    Reconcile,

    /// Check a target-state file without touching the backend
    Validate {
        /// File to check; defaults to the configured target
        file: Option<PathBuf>,
    },

    /// Print the observed state of the backend as YAML
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendArg {
    Docker,
    K3s,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Docker => BackendKind::Docker,
            BackendArg::K3s => BackendKind::K3s,
        }
    }
}

impl Cli {
    /// Configuration file merged with command-line overrides
    fn agent_config(&self) -> Result<AgentConfig> {
        let path = self.config.clone().unwrap_or_else(config::default_config_path);
        let mut config = AgentConfig::load(&path)?;

        if let Some(target) = &self.target {
            config.target_path = target.clone();
        }
        if let Some(backend) = self.backend {
            config.backend = Some(backend.into());
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.agent_config()?;
    let _log_guard = logging::init(&config.logging)?;

    smol::block_on(async {
        match cli.command {
            Commands::Run => commands::run::run(&config).await,
            Commands::Reconcile => commands::reconcile::run(&config).await,
            Commands::Validate { file } => {
                commands::validate::run(file.as_deref().unwrap_or(config.target_path.as_path())).await
            }
            Commands::Status => commands::status::run(&config).await,
        }
    })
}
