//! Resilience primitives shared by the reconciler and every polling loop.

pub mod circuit_breaker;
pub mod lock;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
pub use lock::SingleFlightLock;
pub use retry::{Retry, RetryConfig};
