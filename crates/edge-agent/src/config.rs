//! Agent configuration file.
//!
//! The file is YAML. `${VAR}` and `${VAR:-default}` references are replaced
//! from the environment before the document is parsed, so secrets and
//! host-specific paths can stay out of the file.

use anyhow::{Context, Result, bail};
use edge_orchestration::{BackendKind, DockerConfig, EngineConfig, KubernetesConfig, RetryConfig};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level agent configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Backend to drive; falls back to the target state's setting when unset
    pub backend: Option<BackendKind>,
    /// Container engine connection
    pub docker: DockerConfig,
    /// Kubernetes connection
    pub kubernetes: KubernetesConfig,
    /// Target-state file (YAML, or JSON when the extension is `.json`)
    pub target_path: PathBuf,
    /// How often the target file is checked for changes
    pub target_poll_secs: u64,
    /// Deadline for one driver init attempt
    pub init_timeout_secs: u64,
    /// Driver init attempts before giving up
    pub init_attempts: u32,
    /// Deadline for driver shutdown
    pub shutdown_timeout_secs: u64,
    /// How long shutdown waits for in-flight service operations
    pub shutdown_grace_secs: u64,
    /// Log output
    pub logging: LoggingConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            backend: None,
            docker: DockerConfig::default(),
            kubernetes: KubernetesConfig::default(),
            target_path: PathBuf::from("target-state.yaml"),
            target_poll_secs: 5,
            init_timeout_secs: 30,
            init_attempts: 5,
            shutdown_timeout_secs: 30,
            shutdown_grace_secs: 30,
            logging: LoggingConfig::default(),
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set
    pub level: String,
    /// Line format
    pub format: LogFormat,
    /// Append logs to this file instead of stderr
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
        }
    }
}

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl AgentConfig {
    /// Load the configuration, or the defaults when `path` does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("Invalid agent configuration {}", path.display()))
    }

    /// Parse a configuration document
    pub fn parse(raw: &str) -> Result<Self> {
        let expanded = substitute_env_vars(raw)?;
        if expanded.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&expanded)?)
    }

    /// Engine timing derived from this configuration
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            init_timeout: Duration::from_secs(self.init_timeout_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            init_retry: RetryConfig {
                max_attempts: self.init_attempts,
                ..RetryConfig::default()
            },
        }
    }

    /// Grace period for in-flight operations at shutdown
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Default location of the agent configuration file
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("edge-agent")
        .join("agent.yaml")
}

/// Replace `${VAR}` and `${VAR:-default}` with values from the environment.
///
/// Every unresolved variable is reported in one error.
pub fn substitute_env_vars(input: &str) -> Result<String> {
    let re = Regex::new(r"\$\{([^}]+)\}")?;
    let mut result = String::with_capacity(input.len());
    let mut missing = Vec::new();
    let mut last = 0;

    for cap in re.captures_iter(input) {
        let Some(whole) = cap.get(0) else { continue };
        let expr = &cap[1];
        let (name, default) = match expr.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (expr, None),
        };

        result.push_str(&input[last..whole.start()]);
        match (std::env::var(name), default) {
            (Ok(value), _) => result.push_str(&value),
            (Err(_), Some(default)) => result.push_str(default),
            (Err(_), None) => missing.push(name.to_string()),
        }
        last = whole.end();
    }
    result.push_str(&input[last..]);

    if !missing.is_empty() {
        bail!("Environment variables not set: {}", missing.join(", "));
    }
    Ok(result)
}
