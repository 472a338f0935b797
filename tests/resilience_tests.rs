//! Resilience behaviour: backoff envelopes, breaker transitions, retry
//! exhaustion, and steady-state success against a flaky instance.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use mcp_hub_rs::core::config::ClientConfig;
use mcp_hub_rs::core::error::HubError;
use mcp_hub_rs::instance::{Instance, InstanceClient};
use mcp_hub_rs::net::{CircuitBreaker, CircuitState, ExponentialBackoff};

#[test]
fn test_backoff_default_envelope() {
    let mut backoff = ExponentialBackoff::default();

    let d0 = backoff.next_delay();
    assert!(d0 >= Duration::from_secs(1), "delay(0) was {d0:?}");

    let d1 = backoff.next_delay();
    assert!(d1 > d0, "delay(1)={d1:?} not above delay(0)={d0:?}");

    for _ in 2..=20 {
        backoff.next_delay();
    }
    let d20 = backoff.delay_for(20);
    assert!(d20 <= Duration::from_secs_f64(30.0 * 1.1));

    backoff.reset();
    let after_reset = backoff.next_delay();
    assert!(after_reset >= Duration::from_secs(1));
    assert!(after_reset <= Duration::from_secs_f64(1.1));
}

#[tokio::test]
async fn test_breaker_open_half_open_close_cycle() {
    let breaker = CircuitBreaker::new(3, Duration::from_millis(100));

    for _ in 0..3 {
        breaker.record_failure().await;
    }
    assert_eq!(breaker.state().await, CircuitState::Open);
    assert!(!breaker.allow_request().await);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(breaker.allow_request().await);
    assert_eq!(breaker.state().await, CircuitState::HalfOpen);

    breaker.record_success().await;
    assert_eq!(breaker.state().await, CircuitState::Closed);
}

#[tokio::test]
async fn test_max_retries_exhausted_surfaces_error_once() {
    // Connection resets are retryable; count how many wire attempts the
    // client actually makes before surfacing one classified error.
    let server = MockServer::start().await;
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(move |_: &Request| {
            counter.fetch_add(1, Ordering::SeqCst);
            // An unparsable body classifies as an unknown transient.
            ResponseTemplate::new(200).set_body_string("garbage")
        })
        .mount(&server)
        .await;

    let config = ClientConfig {
        max_retries: 3,
        retry_delay_ms: 5,
        connect_timeout_ms: 500,
        request_timeout_ms: 1_000,
        ..Default::default()
    };
    let instance = Instance::new("flaky", "Flaky", "/tmp", server.address().port()).unwrap();
    let client = InstanceClient::new(instance, config, true).unwrap();

    let err = client.request("ping", None, None).await.unwrap_err();
    assert!(!matches!(err, HubError::CircuitOpen(_)), "got {err:?}");
    assert_eq!(attempts.load(Ordering::SeqCst), 3, "one attempt per retry");
    assert_eq!(client.metrics().await.failed_requests, 1);
}

#[tokio::test]
async fn test_flaky_instance_keeps_majority_success() {
    // One request in ten fails server-side; aggregate success must stay
    // above the 80% stability target.
    let server = MockServer::start().await;
    let counter = Arc::new(AtomicU32::new(0));
    let state = counter.clone();
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .respond_with(move |req: &Request| {
            let n = state.fetch_add(1, Ordering::SeqCst);
            if n % 10 == 9 {
                return ResponseTemplate::new(503);
            }
            let body: Value = serde_json::from_slice(&req.body).unwrap();
            ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": body["id"],
                "result": {}
            }))
        })
        .mount(&server)
        .await;

    let config = ClientConfig {
        max_retries: 1,
        retry_delay_ms: 1,
        connect_timeout_ms: 500,
        request_timeout_ms: 1_000,
        ..Default::default()
    };
    let instance = Instance::new("flaky", "Flaky", "/tmp", server.address().port()).unwrap();
    let client = InstanceClient::new(instance, config, true).unwrap();

    let mut successes = 0u32;
    for _ in 0..100 {
        if client.ping(None).await.is_ok() {
            successes += 1;
        }
    }
    assert!(successes > 80, "only {successes}/100 succeeded");
    assert_eq!(client.metrics().await.circuit_state, CircuitState::Closed);
}
