//! Retry policy composing backoff, circuit breaker, and classification
//!
//! Every attempt is gated by the breaker first: a rejection surfaces
//! `CircuitOpen` immediately with no retry. Failures are classified and
//! retried only while `should_retry()` holds and attempts remain.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::time::sleep;
use tracing::debug;

use crate::core::error::{HubError, HubResult};
use crate::core::logging::{ErrorContext, log_error};
use crate::net::backoff::ExponentialBackoff;
use crate::net::breaker::CircuitBreaker;
use crate::net::classify::NetworkError;

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum attempts, including the first
    pub max_retries: u32,
    /// Backoff template cloned per execution
    pub backoff: ExponentialBackoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: ExponentialBackoff::default(),
        }
    }
}

/// Retry policy bound to one instance's circuit breaker
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    breaker: Arc<CircuitBreaker>,
}

/// Boxed future produced by one retry attempt
pub type AttemptFuture<T> = Pin<Box<dyn Future<Output = Result<T, NetworkError>> + Send>>;

impl RetryPolicy {
    /// Create a policy sharing the given breaker
    pub fn new(config: RetryConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self { config, breaker }
    }

    /// The breaker this policy consults
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Execute `operation` with breaker gating and classified retries.
    ///
    /// The successful attempt records a breaker success and resets the
    /// backoff for the next execution (the backoff is per-call state, so
    /// reset is implicit).
    pub async fn execute<F, T>(&self, mut operation: F, context: ErrorContext) -> HubResult<T>
    where
        F: FnMut() -> AttemptFuture<T>,
    {
        let mut backoff = self.config.backoff.clone();
        let instance = context.instance_id.clone().unwrap_or_default();
        let mut last_error: Option<NetworkError> = None;

        for attempt in 1..=self.config.max_retries {
            self.breaker.check(&instance).await?;

            match operation().await {
                Ok(value) => {
                    self.breaker.record_success().await;
                    if attempt > 1 {
                        debug!(
                            operation = %context.operation,
                            attempt,
                            "succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => {
                    self.breaker.record_failure().await;
                    let retry = err.should_retry() && attempt < self.config.max_retries;
                    debug!(
                        operation = %context.operation,
                        attempt,
                        max = self.config.max_retries,
                        error = %err,
                        retry,
                        "attempt failed"
                    );

                    if !retry {
                        let hub_err: HubError = err.into();
                        log_error(&hub_err, &context);
                        return Err(hub_err);
                    }

                    last_error = Some(err);
                    sleep(backoff.next_delay()).await;
                }
            }
        }

        let final_error: HubError = last_error
            .map(Into::into)
            .unwrap_or_else(|| HubError::internal("retry loop exited without an error"));
        log_error(&final_error, &context);
        Err(final_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            RetryConfig {
                max_retries,
                backoff: ExponentialBackoff::new(
                    Duration::from_millis(5),
                    Duration::from_millis(20),
                    2.0,
                ),
            },
            Arc::new(CircuitBreaker::new(10, Duration::from_secs(60))),
        )
    }

    #[tokio::test]
    async fn test_immediate_success() {
        let policy = fast_policy(3);
        let result = policy
            .execute(
                || Box::pin(async { Ok::<_, NetworkError>(42) }),
                ErrorContext::new("test"),
            )
            .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let policy = fast_policy(3);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = policy
            .execute(
                move || {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Box::pin(async move {
                        if n < 3 {
                            Err(NetworkError::from_message("connection refused"))
                        } else {
                            Ok(7)
                        }
                    })
                },
                ErrorContext::new("test"),
            )
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_once() {
        let policy = fast_policy(3);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: HubResult<()> = policy
            .execute(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async { Err(NetworkError::from_message("permission denied")) })
                },
                ErrorContext::new("test"),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_last_classified_error() {
        let policy = fast_policy(2);
        let result: HubResult<()> = policy
            .execute(
                || Box::pin(async { Err(NetworkError::from_message("operation timed out")) }),
                ErrorContext::new("test"),
            )
            .await;

        assert!(matches!(result.unwrap_err(), HubError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_open_breaker_short_circuits() {
        let breaker = Arc::new(CircuitBreaker::new(1, Duration::from_secs(60)));
        breaker.record_failure().await;

        let policy = RetryPolicy::new(RetryConfig::default(), breaker);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: HubResult<()> = policy
            .execute(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async { Ok(()) })
                },
                ErrorContext::new("test").with_instance("dev-server"),
            )
            .await;

        assert!(matches!(result.unwrap_err(), HubError::CircuitOpen(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_stops_retries() {
        let policy = fast_policy(5);
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: HubResult<()> = policy
            .execute(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async { Err(NetworkError::cancelled("caller went away")) })
                },
                ErrorContext::new("test"),
            )
            .await;

        assert!(matches!(result.unwrap_err(), HubError::Cancelled(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
