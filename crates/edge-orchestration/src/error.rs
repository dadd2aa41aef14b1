//! Error types for orchestration operations

use std::time::Duration;

/// Error type for every driver, engine and resilience operation
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The backend could not be reached during init or a state read
    #[error("Backend unreachable: {0}")]
    BackendUnreachable(String),

    /// An operation was attempted before the driver finished init
    #[error("Driver not ready: {0}")]
    NotReady(String),

    /// The driver has been shut down
    #[error("Driver has been shut down")]
    ShutDown,

    /// An operation did not finish within its deadline
    #[error("Operation '{operation}' timed out after {timeout:?}")]
    Timeout {
        /// Name of the operation that timed out
        operation: String,
        /// Deadline that elapsed
        timeout: Duration,
    },

    /// Pulling a service image failed
    #[error("Failed to pull image '{image}': {message}")]
    ImagePull {
        /// Image reference
        image: String,
        /// Backend message
        message: String,
    },

    /// A service instance was created but failed to start
    #[error("Failed to start service '{service}': {message}")]
    StartFailure {
        /// Service name
        service: String,
        /// Backend message
        message: String,
    },

    /// Service not found on the backend
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// App not found in the target state
    #[error("App not found: {0}")]
    AppNotFound(String),

    /// Generic backend operation failure (transport, CLI exit status, ...)
    #[error("Backend error: {0}")]
    Backend(String),

    /// The backend does not implement this operation
    #[error("Operation not supported by {driver} driver: {operation}")]
    Unsupported {
        /// Driver name
        driver: String,
        /// Operation name
        operation: String,
    },

    /// The submitted target state is malformed
    #[error("Invalid target state: {0}")]
    InvalidTargetState(String),

    /// Another reconciliation pass is already running
    #[error("Reconciliation already in progress")]
    ReconciliationInProgress,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::BackendUnreachable(_) | Error::Timeout { .. } | Error::Backend(_) | Error::Io(_)
        )
    }

    /// Whether the error is a driver lifecycle failure that must abort a whole pass
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::BackendUnreachable(_) | Error::NotReady(_) | Error::ShutDown
        )
    }

    pub(crate) fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    pub(crate) fn unsupported(driver: &str, operation: &str) -> Self {
        Error::Unsupported {
            driver: driver.to_string(),
            operation: operation.to_string(),
        }
    }
}

/// Result type alias for orchestration operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(Error::BackendUnreachable("down".into()).is_fatal());
        assert!(Error::BackendUnreachable("down".into()).is_retryable());
        assert!(Error::Backend("exit 1".into()).is_retryable());
        assert!(!Error::Backend("exit 1".into()).is_fatal());

        let pull = Error::ImagePull {
            image: "nginx:nope".into(),
            message: "manifest unknown".into(),
        };
        assert!(!pull.is_retryable());
        assert!(!pull.is_fatal());
        assert!(!Error::InvalidTargetState("bad".into()).is_retryable());
    }
}
