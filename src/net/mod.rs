//! Networking resilience primitives: backoff, circuit breaking, retry
//! composition, error classification, and connectivity monitoring.

pub mod backoff;
pub mod breaker;
pub mod classify;
pub mod monitor;
pub mod retry;

pub use backoff::ExponentialBackoff;
pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
pub use classify::{NetworkError, NetworkErrorKind};
pub use monitor::{MonitorConfig, NetworkEvent, NetworkMonitor, SleepWakeEvent};
pub use retry::{RetryConfig, RetryPolicy};
