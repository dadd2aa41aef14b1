//! Per-service failure classification and cooldown tracking.

use crate::clock::SharedClock;
use crate::model::{ServiceError, ServiceErrorKind, ServiceKey, ServiceStatus};
use crate::resilience::RetryConfig;
use crate::Error;
use chrono::Duration as ChronoDuration;
use futures::lock::Mutex;
use std::collections::HashMap;
use tracing::{debug, info};

/// Restarts after which a start failure counts as a crash loop
const CRASH_LOOP_RESTARTS: u32 = 3;

impl ServiceErrorKind {
    /// Classify a failed operation, taking the service's history into account
    pub fn classify(
        error: &Error,
        previous: Option<&ServiceError>,
        observed: Option<&ServiceStatus>,
    ) -> Self {
        match error {
            Error::ImagePull { .. } => match previous.map(|p| p.kind) {
                Some(ServiceErrorKind::ErrImagePull) | Some(ServiceErrorKind::ImagePullBackOff) => {
                    ServiceErrorKind::ImagePullBackOff
                }
                _ => ServiceErrorKind::ErrImagePull,
            },
            Error::StartFailure { .. } => {
                let restarts = observed.map(|s| s.restart_count).unwrap_or(0);
                let looping = matches!(
                    previous.map(|p| p.kind),
                    Some(ServiceErrorKind::StartFailure) | Some(ServiceErrorKind::CrashLoopBackOff)
                );
                if restarts >= CRASH_LOOP_RESTARTS || looping {
                    ServiceErrorKind::CrashLoopBackOff
                } else {
                    ServiceErrorKind::StartFailure
                }
            }
            _ => ServiceErrorKind::Unknown,
        }
    }
}

/// Records failures per service and decides when a service may be retried.
///
/// Each failure bumps `retry_count` and sets `next_retry` from the backoff
/// policy passed with it; the reconciler skips services whose `next_retry` lies in the
/// future. Errors are cleared once the service runs healthy.
pub struct ErrorTracker {
    clock: SharedClock,
    errors: Mutex<HashMap<ServiceKey, ServiceError>>,
}

impl ErrorTracker {
    /// Empty tracker reading time from `clock`
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            errors: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure and return the updated error; `backoff` sets the cooldown
    pub async fn record_failure(
        &self,
        key: &ServiceKey,
        error: &Error,
        observed: Option<&ServiceStatus>,
        backoff: &RetryConfig,
    ) -> ServiceError {
        let mut errors = self.errors.lock().await;
        let previous = errors.get(key);
        let kind = ServiceErrorKind::classify(error, previous, observed);
        let retry_count = previous.map(|p| p.retry_count).unwrap_or(0).saturating_add(1);
        let now = self.clock.now();
        let delay = backoff.delay_for_attempt(retry_count);
        let next_retry = ChronoDuration::from_std(delay).ok().map(|d| now + d);

        let service_error = ServiceError {
            kind,
            message: error.to_string(),
            timestamp: now,
            retry_count,
            next_retry,
        };
        info!(
            "Service {} failed ({}, attempt {}); next retry in {:?}",
            key, kind, retry_count, delay
        );
        errors.insert(key.clone(), service_error.clone());
        service_error
    }

    /// Whether the service is still cooling down
    pub async fn in_cooldown(&self, key: &ServiceKey) -> bool {
        let now = self.clock.now();
        self.errors
            .lock()
            .await
            .get(key)
            .and_then(|e| e.next_retry)
            .is_some_and(|deadline| deadline > now)
    }

    /// Current error of a service
    pub async fn get(&self, key: &ServiceKey) -> Option<ServiceError> {
        self.errors.lock().await.get(key).cloned()
    }

    /// Clear the error once the observed status is running and healthy
    pub async fn observe(&self, key: &ServiceKey, status: &ServiceStatus) -> bool {
        if !status.is_running_healthy() {
            return false;
        }
        let cleared = self.errors.lock().await.remove(key).is_some();
        if cleared {
            info!("Service {} recovered; clearing error state", key);
        }
        cleared
    }

    /// Forget a service entirely
    pub async fn forget(&self, key: &ServiceKey) {
        if self.errors.lock().await.remove(key).is_some() {
            debug!("Dropped error state for {}", key);
        }
    }

    /// Snapshot of all tracked errors
    pub async fn all(&self) -> HashMap<ServiceKey, ServiceError> {
        self.errors.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{HealthState, ServiceState};
    use std::sync::Arc;
    use std::time::Duration;

    fn key() -> ServiceKey {
        ServiceKey {
            app_id: "1".into(),
            service_id: "10".into(),
        }
    }

    fn pull_error() -> Error {
        Error::ImagePull {
            image: "nginx:missing".into(),
            message: "manifest unknown".into(),
        }
    }

    #[test]
    fn test_image_pull_escalates_to_backoff() {
        let first = ServiceErrorKind::classify(&pull_error(), None, None);
        assert_eq!(first, ServiceErrorKind::ErrImagePull);

        let previous = ServiceError {
            kind: first,
            message: String::new(),
            timestamp: chrono::Utc::now(),
            retry_count: 1,
            next_retry: None,
        };
        let second = ServiceErrorKind::classify(&pull_error(), Some(&previous), None);
        assert_eq!(second, ServiceErrorKind::ImagePullBackOff);
    }

    #[test]
    fn test_start_failure_with_restarts_is_crash_loop() {
        let start = Error::StartFailure {
            service: "api".into(),
            message: "exit 1".into(),
        };
        assert_eq!(
            ServiceErrorKind::classify(&start, None, None),
            ServiceErrorKind::StartFailure
        );

        let restarting = ServiceStatus {
            restart_count: 5,
            ..ServiceStatus::new(ServiceState::Error)
        };
        assert_eq!(
            ServiceErrorKind::classify(&start, None, Some(&restarting)),
            ServiceErrorKind::CrashLoopBackOff
        );
        assert_eq!(
            ServiceErrorKind::classify(&Error::Backend("x".into()), None, None),
            ServiceErrorKind::Unknown
        );
    }

    #[test]
    fn test_cooldown_follows_backoff_and_clears_on_healthy() {
        futures::executor::block_on(async {
            let clock = Arc::new(ManualClock::at_epoch());
            let tracker = ErrorTracker::new(clock.clone());
            let backoff = RetryConfig::default();

            let first = tracker.record_failure(&key(), &pull_error(), None, &backoff).await;
            assert_eq!(first.retry_count, 1);
            assert!(tracker.in_cooldown(&key()).await);

            clock.advance(Duration::from_millis(1000));
            assert!(!tracker.in_cooldown(&key()).await);

            let second = tracker.record_failure(&key(), &pull_error(), None, &backoff).await;
            assert_eq!(second.retry_count, 2);
            assert_eq!(second.kind, ServiceErrorKind::ImagePullBackOff);
            assert_eq!((second.next_retry.unwrap() - second.timestamp).num_milliseconds(), 2000);

            let unhealthy = ServiceStatus {
                health: HealthState::Unhealthy,
                ..ServiceStatus::new(ServiceState::Running)
            };
            assert!(!tracker.observe(&key(), &unhealthy).await);

            let healthy = ServiceStatus {
                health: HealthState::Healthy,
                ..ServiceStatus::new(ServiceState::Running)
            };
            assert!(tracker.observe(&key(), &healthy).await);
            assert!(tracker.get(&key()).await.is_none());
        });
    }

    #[test]
    fn test_cooldown_uses_the_given_backoff() {
        futures::executor::block_on(async {
            let clock = Arc::new(ManualClock::at_epoch());
            let tracker = ErrorTracker::new(clock.clone());
            let slow = RetryConfig {
                base_delay_ms: 5_000,
                ..RetryConfig::default()
            };

            let error = tracker
                .record_failure(&key(), &Error::Backend("boom".into()), None, &slow)
                .await;
            assert_eq!((error.next_retry.unwrap() - error.timestamp).num_milliseconds(), 5_000);

            clock.advance(Duration::from_millis(4_000));
            assert!(tracker.in_cooldown(&key()).await);
        });
    }
}
