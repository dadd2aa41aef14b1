//! Runtime-agnostic spawning, sleeping and deadlines.
//!
//! Timers come from `async-io`, which drives its own reactor, so `sleep`
//! and `timeout` work on any executor. Background tasks (health monitors)
//! are spawned through [`Spawner`]; the implementation is picked by the
//! `smol` / `tokio` cargo features.

use crate::{Error, Result};
use futures::future::{Either, select};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// Boxed background task
pub type BoxTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A spawner that can run futures in the background
pub trait Spawner: Send + Sync {
    /// Spawn a future; it runs to completion detached from the caller
    fn spawn(&self, future: BoxTask);
}

/// Spawner for the smol runtime
#[cfg(feature = "smol")]
#[derive(Debug, Clone, Copy)]
pub struct SmolSpawner;

#[cfg(feature = "smol")]
impl Spawner for SmolSpawner {
    fn spawn(&self, future: BoxTask) {
        smol::spawn(future).detach();
    }
}

/// Spawner for the tokio runtime
#[cfg(feature = "tokio")]
#[derive(Debug, Clone, Copy)]
pub struct TokioSpawner;

#[cfg(feature = "tokio")]
impl Spawner for TokioSpawner {
    fn spawn(&self, future: BoxTask) {
        tokio::spawn(future);
    }
}

/// Fallback spawner that parks each task on its own OS thread
#[derive(Debug, Clone, Copy)]
pub struct ThreadSpawner;

impl Spawner for ThreadSpawner {
    fn spawn(&self, future: BoxTask) {
        std::thread::spawn(move || futures::executor::block_on(future));
    }
}

/// Spawner selected by the enabled runtime feature
pub fn default_spawner() -> Arc<dyn Spawner> {
    #[cfg(feature = "smol")]
    {
        Arc::new(SmolSpawner)
    }

    #[cfg(all(feature = "tokio", not(feature = "smol")))]
    {
        Arc::new(TokioSpawner)
    }

    #[cfg(not(any(feature = "smol", feature = "tokio")))]
    {
        Arc::new(ThreadSpawner)
    }
}

/// Sleep for the given duration
pub async fn sleep(duration: Duration) {
    async_io::Timer::after(duration).await;
}

/// Run `future` with a deadline, mapping expiry to [`Error::Timeout`]
pub async fn timeout<F, T>(operation: &str, duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let future = Box::pin(future);
    let timer = Box::pin(async_io::Timer::after(duration));
    match select(future, timer).await {
        Either::Left((result, _)) => result,
        Either::Right(_) => Err(Error::timeout(operation, duration)),
    }
}
