//! Runtime dependencies handed to every driver.

use crate::clock::{SharedClock, system_clock};
use crate::events::Notifier;
use crate::runtime::{Spawner, default_spawner};
use std::sync::Arc;
use std::time::Duration;

/// Context object carrying runtime dependencies into a driver
///
/// Lets drivers spawn health monitors, read time and emit notifications
/// without depending on a particular async runtime.
#[derive(Clone)]
pub struct DriverContext {
    /// Spawner for background tasks
    pub spawner: Arc<dyn Spawner>,

    /// Time source
    pub clock: SharedClock,

    /// Notification fan-out shared with the engine
    pub notifier: Notifier,

    /// How long `shutdown` waits for in-flight operations before aborting them
    pub shutdown_grace: Duration,
}

impl Default for DriverContext {
    fn default() -> Self {
        Self {
            spawner: default_spawner(),
            clock: system_clock(),
            notifier: Notifier::new(),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl DriverContext {
    /// Context with the runtime selected by cargo features and the system clock
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific spawner
    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Use a specific clock
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Share an existing notifier
    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    /// Grace period for in-flight operations during shutdown
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}
