//! Notifications emitted by drivers and the reconciler.
//!
//! Consumers subscribe to a [`Notifier`] and receive every event on their
//! own channel, in emission order.

use crate::model::{HealthState, ReconciliationResult, ServiceError};
use async_channel::{Receiver, Sender};
use futures::lock::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Named events for logging, telemetry and the management API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Notification {
    /// A service instance started
    ServiceStarted {
        /// Service name
        service_name: String,
        /// Backend instance id
        container_id: String,
    },
    /// A service instance stopped
    ServiceStopped {
        /// Service name
        service_name: String,
        /// Backend instance id
        container_id: String,
        /// Exit code, when known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i64>,
    },
    /// An operation on a service failed
    ServiceError {
        /// Service name
        service_name: String,
        /// Classified error
        error: ServiceError,
    },
    /// A service's aggregated probe health changed
    HealthChanged {
        /// Service name
        service_name: String,
        /// New health
        health: HealthState,
    },
    /// A reconciliation pass finished
    ReconciliationComplete {
        /// Pass outcome
        result: ReconciliationResult,
    },
}

impl Notification {
    /// Event name as used on the wire
    pub fn name(&self) -> &'static str {
        match self {
            Notification::ServiceStarted { .. } => "service-started",
            Notification::ServiceStopped { .. } => "service-stopped",
            Notification::ServiceError { .. } => "service-error",
            Notification::HealthChanged { .. } => "health-changed",
            Notification::ReconciliationComplete { .. } => "reconciliation-complete",
        }
    }
}

/// Fan-out of notifications to subscriber channels
#[derive(Clone, Default)]
pub struct Notifier {
    subscribers: Arc<Mutex<Vec<Sender<Notification>>>>,
}

impl Notifier {
    /// Notifier without subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new unbounded subscriber
    pub async fn subscribe(&self) -> Receiver<Notification> {
        let (tx, rx) = async_channel::unbounded();
        self.subscribers.lock().await.push(tx);
        rx
    }

    /// Deliver a notification to every live subscriber
    pub async fn emit(&self, notification: Notification) {
        debug!("Emitting {}", notification.name());
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| tx.try_send(notification.clone()).is_ok());
    }

    /// Number of live subscribers
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}
