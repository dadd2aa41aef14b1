//! Consecutive-failure circuit breaker with a fixed cooldown.

use crate::clock::SharedClock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use tracing::{info, warn};

const CLOSED: i64 = i64::MIN;

/// Circuit breaker policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub max_failures: u32,
    /// How long the circuit stays open, in milliseconds
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 10,
            cooldown_ms: 300_000,
        }
    }
}

/// Tracks consecutive failures independently of any retry session.
///
/// Once `max_failures` consecutive failures are recorded the breaker opens
/// for `cooldown_ms`. The first `is_open` check after the window has
/// elapsed closes it again and resets the counter.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    failures: AtomicU32,
    opened_at_ms: AtomicI64,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            failures: AtomicU32::new(0),
            opened_at_ms: AtomicI64::new(CLOSED),
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        if failures >= self.config.max_failures && self.opened_at_ms.load(Ordering::SeqCst) == CLOSED {
            let now = self.clock.now().timestamp_millis();
            if self
                .opened_at_ms
                .compare_exchange(CLOSED, now, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                warn!(
                    "Circuit '{}' opened after {} consecutive failures; cooling down for {}ms",
                    self.name, failures, self.config.cooldown_ms
                );
            }
        }
    }

    /// Record a successful call, closing the breaker
    pub fn record_success(&self) {
        self.failures.store(0, Ordering::SeqCst);
        self.opened_at_ms.store(CLOSED, Ordering::SeqCst);
    }

    /// Whether calls should currently be short-circuited
    pub fn is_open(&self) -> bool {
        let opened_at = self.opened_at_ms.load(Ordering::SeqCst);
        if opened_at == CLOSED {
            return false;
        }

        let elapsed = self.clock.now().timestamp_millis() - opened_at;
        if elapsed >= self.config.cooldown_ms as i64 {
            if self
                .opened_at_ms
                .compare_exchange(opened_at, CLOSED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.failures.store(0, Ordering::SeqCst);
                info!("Circuit '{}' closed after cooldown", self.name);
            }
            return false;
        }

        true
    }

    /// Consecutive failures recorded so far
    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Policy in use
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;
    use std::time::Duration;

    fn breaker(clock: Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::new("test", CircuitBreakerConfig::default(), clock)
    }

    #[test]
    fn test_opens_after_max_failures_and_closes_after_cooldown() {
        let clock = Arc::new(ManualClock::at_epoch());
        let breaker = breaker(clock.clone());

        for _ in 0..9 {
            breaker.record_failure();
        }
        assert!(!breaker.is_open());

        breaker.record_failure();
        assert!(breaker.is_open());

        clock.advance(Duration::from_millis(299_999));
        assert!(breaker.is_open());

        clock.advance(Duration::from_millis(1));
        assert!(!breaker.is_open());
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_success_resets_immediately() {
        let clock = Arc::new(ManualClock::at_epoch());
        let breaker = breaker(clock);

        for _ in 0..10 {
            breaker.record_failure();
        }
        assert!(breaker.is_open());

        breaker.record_success();
        assert!(!breaker.is_open());
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_failures_while_open_do_not_extend_window() {
        let clock = Arc::new(ManualClock::at_epoch());
        let breaker = breaker(clock.clone());

        for _ in 0..10 {
            breaker.record_failure();
        }
        clock.advance(Duration::from_millis(200_000));
        breaker.record_failure();
        clock.advance(Duration::from_millis(100_000));
        assert!(!breaker.is_open());
    }
}
