//! Non-blocking single-flight lock.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Allows at most one in-flight execution of a guarded operation.
///
/// A caller that arrives while another execution is running gets `None`
/// back instead of waiting. Clones share the same lock.
#[derive(Debug, Clone, Default)]
pub struct SingleFlightLock {
    locked: Arc<AtomicBool>,
}

struct Release<'a>(&'a AtomicBool);

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SingleFlightLock {
    /// Create an unlocked lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an execution is currently in flight
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Run `operation` if no other execution is in flight.
    ///
    /// The lock is released on every exit path, including errors, panics
    /// and the returned future being dropped mid-flight.
    pub async fn try_execute<F, Fut, T>(&self, operation: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if self
            .locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        let _release = Release(&self.locked);
        Some(operation().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use futures::future::join;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_overlapping_calls_execute_once() {
        futures::executor::block_on(async {
            let lock = SingleFlightLock::new();
            let executions = Arc::new(AtomicU32::new(0));
            let (release_tx, release_rx) = async_channel::bounded::<()>(1);

            let first = {
                let executions = executions.clone();
                lock.try_execute(|| async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    let _ = release_rx.recv().await;
                    "first"
                })
            };
            let second = async {
                // Runs after `first` has parked on the channel
                let result = lock
                    .try_execute(|| async {
                        executions.fetch_add(1, Ordering::SeqCst);
                        "second"
                    })
                    .await;
                let _ = release_tx.send(()).await;
                result
            };

            let (first, second) = join(first, second).await;
            assert_eq!(first, Some("first"));
            assert_eq!(second, None);
            assert_eq!(executions.load(Ordering::SeqCst), 1);
            assert!(!lock.is_locked());
        });
    }

    #[test]
    fn test_released_after_error() {
        futures::executor::block_on(async {
            let lock = SingleFlightLock::new();
            let result = lock
                .try_execute(|| async { Err::<(), _>(Error::Backend("boom".into())) })
                .await;
            assert!(matches!(result, Some(Err(Error::Backend(_)))));
            assert!(!lock.is_locked());

            let again = lock.try_execute(|| async { 1 }).await;
            assert_eq!(again, Some(1));
        });
    }
}
