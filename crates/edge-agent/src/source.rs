//! File-backed target-state source.
//!
//! The agent reads its desired state from a local file that some other
//! process (a management client, a provisioning script) keeps up to date.
//! Each poll re-reads the file and hands back a new [`TargetState`] only
//! when the contents changed.

use anyhow::{Context, Result};
use edge_orchestration::{
    CircuitBreaker, CircuitBreakerConfig, Retry, RetryConfig, TargetState, system_clock,
};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Parse a target-state document; JSON when the path ends in `.json`, YAML otherwise
pub fn parse_target(path: &Path, raw: &str) -> Result<TargetState> {
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let state = if is_json {
        serde_json::from_str(raw)?
    } else {
        serde_yaml::from_str(raw)?
    };
    Ok(state)
}

/// Read and parse a target-state file
pub fn load_target(path: &Path) -> Result<TargetState> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read target state {}", path.display()))?;
    parse_target(path, &raw)
        .with_context(|| format!("Failed to parse target state {}", path.display()))
}

/// Polls a target-state file for changes
pub struct FileTargetSource {
    path: PathBuf,
    retry: RetryConfig,
    breaker: CircuitBreaker,
    last_applied: Option<String>,
}

impl FileTargetSource {
    /// Source with short read retries and a breaker that backs off after
    /// five consecutive failed polls
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_policy(
            path,
            RetryConfig {
                max_attempts: 3,
                base_delay_ms: 200,
                max_delay_ms: 1_000,
                ..RetryConfig::default()
            },
            CircuitBreakerConfig {
                max_failures: 5,
                cooldown_ms: 60_000,
            },
        )
    }

    /// Source with explicit read retry and breaker policies
    pub fn with_policy(
        path: impl Into<PathBuf>,
        retry: RetryConfig,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        Self {
            path: path.into(),
            retry,
            breaker: CircuitBreaker::new("target-source", breaker, system_clock()),
            last_applied: None,
        }
    }

    /// File being watched
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check the file once.
    ///
    /// Returns `Ok(None)` when nothing changed or when recent polls kept
    /// failing and the breaker is cooling down.
    pub async fn poll(&mut self) -> Result<Option<TargetState>> {
        if self.breaker.is_open() {
            debug!(path = %self.path.display(), "Target source cooling down after repeated failures");
            return Ok(None);
        }

        let path = self.path.clone();
        let read = Retry::new(self.retry.clone())
            .on_retry(|attempt, delay, error: &anyhow::Error| {
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "Re-reading target state");
            })
            .execute("read target state", || {
                let path = path.clone();
                async move {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read target state {}", path.display()))?;
                    let state = parse_target(&path, &raw)
                        .with_context(|| format!("Failed to parse target state {}", path.display()))?;
                    Ok::<_, anyhow::Error>((raw, state))
                }
            })
            .await;

        match read {
            Ok((raw, state)) => {
                self.breaker.record_success();
                if self.last_applied.as_deref() == Some(raw.as_str()) {
                    return Ok(None);
                }
                info!(path = %self.path.display(), apps = state.apps.len(), "Target state changed");
                self.last_applied = Some(raw);
                Ok(Some(state))
            }
            Err(error) => {
                self.breaker.record_failure();
                warn!(
                    path = %self.path.display(),
                    failures = self.breaker.failure_count(),
                    error = %error,
                    "Failed to load target state"
                );
                Err(error)
            }
        }
    }

    /// Forget the last applied contents so the next poll reports them again
    pub fn reset(&mut self) {
        self.last_applied = None;
    }
}
