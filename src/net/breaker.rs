//! Circuit breaker for protecting instances against cascading failures
//!
//! Closed admits everything; Open rejects with a distinguishable error
//! until the recovery timeout elapses; HalfOpen admits a capped number of
//! concurrent probes whose outcome decides the next state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::core::error::{HubError, HubResult};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests pass through normally
    Closed,
    /// Requests fail immediately
    Open,
    /// Testing whether the instance has recovered
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// Time to wait in Open before admitting probes
    pub recovery_timeout: Duration,
    /// Successful probes required in HalfOpen to close
    pub success_threshold: u32,
    /// Concurrent probes admitted while HalfOpen
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            // First admitted probe decides.
            success_threshold: 1,
            half_open_max_requests: 3,
        }
    }
}

// Monotonic base for the lock-free last-failure timestamp.
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

fn monotonic_millis() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// Circuit breaker tracking failures toward one instance
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    failure_count: AtomicU32,
    success_count: AtomicU32,
    last_failure_millis: AtomicU64,
    half_open_requests: AtomicU32,
    state: Arc<RwLock<CircuitState>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::with_config(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    /// Create a breaker with the given threshold and recovery timeout;
    /// the first admitted HalfOpen probe decides the outcome.
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self::with_config(CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout,
            ..Default::default()
        })
    }

    /// Create a breaker from a full configuration
    pub fn with_config(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            failure_count: AtomicU32::new(0),
            success_count: AtomicU32::new(0),
            last_failure_millis: AtomicU64::new(0),
            half_open_requests: AtomicU32::new(0),
            state: Arc::new(RwLock::new(CircuitState::Closed)),
        }
    }

    /// Current circuit state, after applying any pending Open→HalfOpen
    /// transition
    pub async fn state(&self) -> CircuitState {
        self.update_state_if_needed().await
    }

    /// Decide whether a request may proceed. A HalfOpen admission counts
    /// against the probe cap and must be paired with `record_success` or
    /// `record_failure`.
    pub async fn allow_request(&self) -> bool {
        match self.update_state_if_needed().await {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                let current = self.half_open_requests.fetch_add(1, Ordering::SeqCst);
                if current >= self.config.half_open_max_requests {
                    self.half_open_requests.fetch_sub(1, Ordering::SeqCst);
                    false
                } else {
                    true
                }
            }
        }
    }

    /// Gate variant returning the distinguishable rejection error
    pub async fn check(&self, instance_id: &str) -> HubResult<()> {
        if self.allow_request().await {
            Ok(())
        } else {
            Err(HubError::circuit_open(instance_id))
        }
    }

    /// Record a successful request
    pub async fn record_success(&self) {
        let state = *self.state.read().await;
        match state {
            CircuitState::Closed => {
                self.failure_count.store(0, Ordering::SeqCst);
            }
            CircuitState::HalfOpen => {
                self.release_probe();
                let successes = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold {
                    let mut state = self.state.write().await;
                    if *state == CircuitState::HalfOpen {
                        *state = CircuitState::Closed;
                        self.failure_count.store(0, Ordering::SeqCst);
                        self.success_count.store(0, Ordering::SeqCst);
                        debug!(successes, "circuit closed after recovery probes");
                    }
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed request
    pub async fn record_failure(&self) {
        self.last_failure_millis
            .store(monotonic_millis(), Ordering::SeqCst);
        let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;

        let mut state = self.state.write().await;
        match *state {
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold {
                    *state = CircuitState::Open;
                    warn!(
                        failures,
                        recovery = ?self.config.recovery_timeout,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.release_probe();
                *state = CircuitState::Open;
                self.success_count.store(0, Ordering::SeqCst);
                warn!("circuit reopened by failed probe");
            }
            CircuitState::Open => {}
        }
    }

    /// Force the breaker back to Closed, clearing all counts. Used when a
    /// wake-from-sleep invalidates accumulated failures.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        *state = CircuitState::Closed;
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
        self.half_open_requests.store(0, Ordering::SeqCst);
    }

    fn release_probe(&self) {
        let _ = self
            .half_open_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
    }

    async fn update_state_if_needed(&self) -> CircuitState {
        let current = *self.state.read().await;
        if current != CircuitState::Open {
            return current;
        }

        let last_failure = self.last_failure_millis.load(Ordering::SeqCst);
        let elapsed = monotonic_millis().saturating_sub(last_failure);
        if elapsed < self.config.recovery_timeout.as_millis() as u64 {
            return CircuitState::Open;
        }

        let mut state = self.state.write().await;
        if *state == CircuitState::Open {
            *state = CircuitState::HalfOpen;
            self.success_count.store(0, Ordering::SeqCst);
            self.half_open_requests.store(0, Ordering::SeqCst);
            debug!("circuit transitioned to HalfOpen");
        }
        *state
    }

    /// Snapshot of breaker counters
    pub async fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: *self.state.read().await,
            failure_count: self.failure_count.load(Ordering::SeqCst),
            success_count: self.success_count.load(Ordering::SeqCst),
            half_open_requests: self.half_open_requests.load(Ordering::SeqCst),
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_requests: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(100));

        for _ in 0..3 {
            assert!(breaker.allow_request().await);
            breaker.record_failure().await;
        }

        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(!breaker.allow_request().await);
    }

    #[tokio::test]
    async fn test_half_open_after_recovery_and_single_success_closes() {
        let breaker = CircuitBreaker::new(3, Duration::from_millis(100));

        for _ in 0..3 {
            breaker.record_failure().await;
        }
        assert!(!breaker.allow_request().await);

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(breaker.allow_request().await);
        assert_eq!(*breaker.state.read().await, CircuitState::HalfOpen);

        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(50));
        breaker.record_failure().await;
        breaker.record_failure().await;

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert!(breaker.allow_request().await);

        breaker.record_failure().await;
        assert_eq!(*breaker.state.read().await, CircuitState::Open);
        assert!(!breaker.allow_request().await);
    }

    #[tokio::test]
    async fn test_no_direct_closed_to_half_open() {
        // Failures below threshold leave the circuit Closed.
        let breaker = CircuitBreaker::new(5, Duration::from_millis(10));
        breaker.record_failure().await;
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_probe_cap() {
        let breaker = CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(20),
            success_threshold: 1,
            half_open_max_requests: 2,
        });
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(breaker.allow_request().await);
        assert!(breaker.allow_request().await);
        // Third concurrent probe is rejected.
        assert!(!breaker.allow_request().await);
    }

    #[tokio::test]
    async fn test_multi_success_threshold() {
        let breaker = CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(20),
            success_threshold: 3,
            half_open_max_requests: 3,
        });
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        for _ in 0..2 {
            assert!(breaker.allow_request().await);
            breaker.record_success().await;
            assert_eq!(*breaker.state.read().await, CircuitState::HalfOpen);
        }
        assert!(breaker.allow_request().await);
        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset_clears_open_circuit() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure().await;
        assert!(!breaker.allow_request().await);

        breaker.reset().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert!(breaker.allow_request().await);
        assert_eq!(breaker.stats().await.failure_count, 0);
    }

    #[tokio::test]
    async fn test_check_returns_circuit_open_error() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure().await;

        let err = breaker.check("dev-server").await.unwrap_err();
        assert!(matches!(err, HubError::CircuitOpen(_)));
    }
}
