//! Retry with exponential backoff.

use crate::runtime::sleep;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff policy shared by retry sessions and error cooldowns
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay_ms: u64,
    /// Upper bound for any single delay
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
    /// Random spread applied to each delay, in percent (0 disables jitter)
    pub jitter_percent: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_percent: 0.0,
        }
    }
}

impl RetryConfig {
    /// Un-jittered delay after failed attempt `attempt` (1-based):
    /// `min(max_delay_ms, base_delay_ms * backoff_multiplier^(attempt-1))`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Delay after failed attempt `attempt` with jitter applied
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if self.jitter_percent <= 0.0 {
            return delay;
        }
        let spread = delay.as_millis() as f64 * self.jitter_percent / 100.0;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis((delay.as_millis() as f64 + offset).max(0.0) as u64)
    }
}

type Classifier<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;
type RetryHook<E> = Arc<dyn Fn(u32, Duration, &E) + Send + Sync>;
type FailureHook<E> = Arc<dyn Fn(u32, &E) + Send + Sync>;
type SuccessHook = Arc<dyn Fn(u32) + Send + Sync>;

/// Executes fallible async operations with backoff between attempts
pub struct Retry<E> {
    config: RetryConfig,
    is_retryable: Classifier<E>,
    on_retry: Option<RetryHook<E>>,
    on_failure: Option<FailureHook<E>>,
    on_success: Option<SuccessHook>,
    consecutive_failures: AtomicU32,
}

impl<E: std::fmt::Display> Retry<E> {
    /// Create a retry session that treats every error as retryable
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            is_retryable: Arc::new(|_| true),
            on_retry: None,
            on_failure: None,
            on_success: None,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Decide per error whether another attempt is allowed
    pub fn with_classifier(mut self, classifier: impl Fn(&E) -> bool + Send + Sync + 'static) -> Self {
        self.is_retryable = Arc::new(classifier);
        self
    }

    /// Called before sleeping ahead of the next attempt
    pub fn on_retry(mut self, hook: impl Fn(u32, Duration, &E) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Called once when the operation gives up
    pub fn on_failure(mut self, hook: impl Fn(u32, &E) + Send + Sync + 'static) -> Self {
        self.on_failure = Some(Arc::new(hook));
        self
    }

    /// Called once when an attempt succeeds
    pub fn on_success(mut self, hook: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(hook));
        self
    }

    /// Policy in use
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Failed attempts since the last success
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Forget previous failures
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Run `operation` until it succeeds, fails fatally, or attempts run out
    pub async fn execute<F, Fut, T>(&self, name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => {
                    self.reset();
                    if let Some(hook) = &self.on_success {
                        hook(attempt);
                    }
                    if attempt > 1 {
                        debug!("'{}' succeeded after {} attempts", name, attempt);
                    }
                    return Ok(value);
                }
                Err(error) => {
                    self.consecutive_failures.fetch_add(1, Ordering::SeqCst);

                    let retryable = (self.is_retryable)(&error);
                    if !retryable || attempt >= max_attempts {
                        if retryable {
                            warn!("'{}' failed after {} attempts: {}", name, attempt, error);
                        } else {
                            warn!("'{}' failed with non-retryable error: {}", name, error);
                        }
                        if let Some(hook) = &self.on_failure {
                            hook(attempt, &error);
                        }
                        return Err(error);
                    }

                    let delay = self.config.jittered_delay(attempt);
                    debug!(
                        "'{}' attempt {}/{} failed: {}; retrying in {:?}",
                        name, attempt, max_attempts, error, delay
                    );
                    if let Some(hook) = &self.on_retry {
                        hook(attempt, delay, &error);
                    }
                    sleep(delay).await;
                }
            }
        }
    }
}
