//! Resilient per-instance JSON-RPC client
//!
//! One client per instance, carrying its own HTTP pool, circuit breaker,
//! and retry policy. Every send is gated by the breaker, classified on
//! failure, and retried only while the classification allows it.
//! Response bodies are size-capped before decoding.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::core::config::ClientConfig;
use crate::core::error::{HubError, HubResult};
use crate::core::logging::ErrorContext;
use crate::instance::Instance;
use crate::net::backoff::ExponentialBackoff;
use crate::net::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::net::classify::NetworkError;
use crate::net::retry::{RetryConfig, RetryPolicy};
use crate::protocol::messages::{
    CallToolResult, GetPromptParams, GetPromptResult, InitializeParams, InitializeResult,
    ListPromptsResult, ListResourcesResult, ListToolsResult, ReadResourceResult, ResourceParams,
    methods,
};
use crate::protocol::types::{
    ClientCapabilities, ClientInfo, JsonRpcNotification, JsonRpcRequest, error_codes,
};

/// Outcome of one wire round-trip: transport success carrying either a
/// result or a terminal application-level failure (JSON-RPC error
/// object, oversize body). Terminal failures are never retried.
type RpcOutcome = Result<Value, HubError>;

/// Snapshot of client request counters
#[derive(Debug, Clone)]
pub struct ClientMetrics {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub timeout_requests: u64,
    pub circuit_state: CircuitState,
    pub failure_count: u32,
}

/// JSON-RPC 2.0 client bound to one instance
pub struct InstanceClient {
    instance: Instance,
    endpoint: String,
    http: reqwest::Client,
    config: ClientConfig,
    policy: RetryPolicy,
    request_id: AtomicI64,
    closed: AtomicBool,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    timeout_requests: AtomicU64,
}

impl std::fmt::Debug for InstanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceClient")
            .field("instance", &self.instance.id)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl InstanceClient {
    /// Build a client for `instance`. `robust` selects the persistent
    /// pooled connection profile; otherwise a single client-level
    /// deadline bounds every request.
    pub fn new(instance: Instance, config: ClientConfig, robust: bool) -> HubResult<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .pool_max_idle_per_host(if config.disable_keep_alives {
                0
            } else {
                config.max_conns_per_host
            });

        if robust {
            // Persistent profile: the pool outlives long idle stretches
            // and only per-request deadlines apply.
            builder = builder
                .pool_idle_timeout(Duration::from_secs(24 * 60 * 60))
                .tcp_keepalive(Duration::from_secs(30));
        } else {
            builder = builder
                .pool_idle_timeout(Duration::from_millis(config.idle_conn_timeout_ms))
                .timeout(config.request_timeout());
        }

        let http = builder
            .build()
            .map_err(|e| HubError::connection(format!("failed to build HTTP client: {e}")))?;

        let breaker = Arc::new(CircuitBreaker::with_config(CircuitBreakerConfig {
            failure_threshold: config.failure_threshold,
            recovery_timeout: Duration::from_millis(config.recovery_timeout_ms),
            success_threshold: config.half_open_successes,
            half_open_max_requests: config.half_open_successes.max(1),
        }));
        let policy = RetryPolicy::new(
            RetryConfig {
                max_retries: config.max_retries.max(1),
                backoff: ExponentialBackoff::new(
                    Duration::from_millis(config.retry_delay_ms),
                    Duration::from_secs(30),
                    config.retry_backoff,
                ),
            },
            breaker,
        );

        // Nanosecond-seeded so IDs stay unique across client rebuilds
        // for the same instance.
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as i64;

        let endpoint = format!("{}/mcp", instance.base_url());
        Ok(Self {
            instance,
            endpoint,
            http,
            config,
            policy,
            request_id: AtomicI64::new(seed),
            closed: AtomicBool::new(false),
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            timeout_requests: AtomicU64::new(0),
        })
    }

    /// The instance this client targets
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    fn next_request_id(&self) -> i64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Send one JSON-RPC request through the retry/breaker wrapper.
    ///
    /// `deadline` bounds each wire attempt; the configured default (30s)
    /// applies when `None`.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Option<Duration>,
    ) -> HubResult<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HubError::Cancelled(format!(
                "client for {} is closed",
                self.instance.id
            )));
        }

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let timeout = deadline.unwrap_or_else(|| self.config.request_timeout());
        let context = ErrorContext::new("instance_request")
            .with_method(method)
            .with_instance(&self.instance.id);

        let outcome = self
            .policy
            .execute(
                || {
                    // Each attempt gets a fresh request ID and an owned
                    // view of the wire context so the future is 'static.
                    let attempt = WireAttempt {
                        http: self.http.clone(),
                        endpoint: self.endpoint.clone(),
                        instance_id: self.instance.id.clone(),
                        id: self.next_request_id(),
                        method: method.to_string(),
                        params: params.clone(),
                        timeout,
                        limit: self.config.max_response_bytes,
                    };
                    Box::pin(attempt.send())
                },
                context,
            )
            .await;

        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
            Err(err) => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
                if matches!(err, HubError::Timeout(_)) {
                    self.timeout_requests.fetch_add(1, Ordering::Relaxed);
                }
                Err(err)
            }
        }
    }

    /// Fire a JSON-RPC notification; failures are logged, not surfaced.
    async fn notify(&self, method: &str, params: Option<Value>) {
        let Ok(notification) = JsonRpcNotification::new(method, params) else {
            return;
        };
        let sent = self
            .http
            .post(&self.endpoint)
            .timeout(Duration::from_secs(5))
            .json(&notification)
            .send()
            .await;
        if let Err(err) = sent {
            debug!(instance = %self.instance.id, method, %err, "notification dropped");
        }
    }

    // ========================================================================
    // Typed operations
    // ========================================================================

    /// Perform the MCP handshake, then announce `notifications/initialized`.
    pub async fn initialize(&self, deadline: Option<Duration>) -> HubResult<InitializeResult> {
        let params = InitializeParams {
            protocol_version: crate::protocol::types::PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: Some(ClientInfo::new("mcp-hub", env!("CARGO_PKG_VERSION"))),
        };
        let result = self
            .request(methods::INITIALIZE, Some(serde_json::to_value(&params)?), deadline)
            .await?;
        let parsed: InitializeResult = serde_json::from_value(result)?;

        self.notify(methods::INITIALIZED, None).await;
        Ok(parsed)
    }

    /// Liveness probe
    pub async fn ping(&self, deadline: Option<Duration>) -> HubResult<()> {
        self.request(methods::PING, None, deadline).await.map(|_| ())
    }

    pub async fn list_tools(&self, deadline: Option<Duration>) -> HubResult<ListToolsResult> {
        let result = self.request(methods::TOOLS_LIST, None, deadline).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        deadline: Option<Duration>,
    ) -> HubResult<CallToolResult> {
        let params = json!({"name": name, "arguments": arguments.unwrap_or(Value::Null)});
        let result = self
            .request(methods::TOOLS_CALL, Some(params), deadline)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn list_resources(
        &self,
        deadline: Option<Duration>,
    ) -> HubResult<ListResourcesResult> {
        let result = self.request(methods::RESOURCES_LIST, None, deadline).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn read_resource(
        &self,
        uri: &str,
        deadline: Option<Duration>,
    ) -> HubResult<ReadResourceResult> {
        let params = serde_json::to_value(ResourceParams { uri: uri.to_string() })?;
        let result = self
            .request(methods::RESOURCES_READ, Some(params), deadline)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn list_prompts(&self, deadline: Option<Duration>) -> HubResult<ListPromptsResult> {
        let result = self.request(methods::PROMPTS_LIST, None, deadline).await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn get_prompt(
        &self,
        params: GetPromptParams,
        deadline: Option<Duration>,
    ) -> HubResult<GetPromptResult> {
        let result = self
            .request(methods::PROMPTS_GET, Some(serde_json::to_value(&params)?), deadline)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Mark the client closed; subsequent sends fail fast.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(instance = %self.instance.id, "client closed");
        }
    }

    /// Reset the circuit breaker, e.g. after a wake from sleep.
    pub async fn reset_breaker(&self) {
        self.policy.breaker().reset().await;
        warn!(instance = %self.instance.id, "circuit breaker reset");
    }

    /// Snapshot of request counters and breaker state
    pub async fn metrics(&self) -> ClientMetrics {
        let stats = self.policy.breaker().stats().await;
        ClientMetrics {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            timeout_requests: self.timeout_requests.load(Ordering::Relaxed),
            circuit_state: stats.state,
            failure_count: stats.failure_count,
        }
    }
}

/// Owned context for one wire attempt
struct WireAttempt {
    http: reqwest::Client,
    endpoint: String,
    instance_id: String,
    id: i64,
    method: String,
    params: Option<Value>,
    timeout: Duration,
    limit: usize,
}

impl WireAttempt {
    async fn send(mut self) -> Result<RpcOutcome, NetworkError> {
        let params = self.params.take();
        let request = JsonRpcRequest::new(Value::from(self.id), self.method.clone(), params)
            .map_err(|e| NetworkError::from_message(&e.to_string()))?;

        let response = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                NetworkError::from_reqwest(&e, None)
                    .with_context(self.method.clone())
                    .with_instance(self.instance_id.clone())
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NetworkError::from_status(
                status.as_u16(),
                format!("HTTP {} from {}", status.as_u16(), self.endpoint),
            )
            .with_context(self.method.clone())
            .with_instance(self.instance_id.clone()));
        }

        let body = match self.read_capped_body(response).await {
            Ok(body) => body,
            Err(ReadBodyError::TooLarge(err)) => return Ok(Err(err)),
            Err(ReadBodyError::Transport(err)) => return Err(err),
        };
        let message: Value = serde_json::from_slice(&body).map_err(|e| {
            NetworkError::from_message(&format!("undecodable response body: {e}"))
                .with_instance(self.instance_id.clone())
        })?;

        // Responses are matched by id.
        if message.get("id") != Some(&Value::from(self.id)) {
            return Err(NetworkError::from_message(&format!(
                "response id {:?} does not match request id {}",
                message.get("id"),
                self.id
            )));
        }

        if let Some(error) = message.get("error") {
            let code = error
                .get("code")
                .and_then(Value::as_i64)
                .unwrap_or(error_codes::INTERNAL_ERROR as i64) as i32;
            let text = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Ok(Err(rpc_error_to_hub(code, text)));
        }

        Ok(Ok(message.get("result").cloned().unwrap_or(Value::Null)))
    }

    async fn read_capped_body(
        &self,
        mut response: reqwest::Response,
    ) -> Result<Vec<u8>, ReadBodyError> {
        if let Some(length) = response.content_length()
            && length as usize > self.limit
        {
            return Err(self.oversize(length as usize));
        }

        let mut body = Vec::new();
        loop {
            let chunk = response.chunk().await.map_err(|e| {
                ReadBodyError::Transport(
                    NetworkError::from_reqwest(&e, None).with_instance(self.instance_id.clone()),
                )
            })?;
            let Some(chunk) = chunk else { break };
            if body.len() + chunk.len() > self.limit {
                return Err(self.oversize(body.len() + chunk.len()));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    fn oversize(&self, size: usize) -> ReadBodyError {
        ReadBodyError::TooLarge(HubError::ResponseTooLarge(format!(
            "{} returned {size} bytes, limit is {}",
            self.instance_id, self.limit
        )))
    }
}

enum ReadBodyError {
    /// Hard decode failure, never retried
    TooLarge(HubError),
    /// Connection-level failure, classified and possibly retried
    Transport(NetworkError),
}

fn rpc_error_to_hub(code: i32, message: String) -> HubError {
    match code {
        error_codes::METHOD_NOT_FOUND => HubError::MethodNotFound(message),
        error_codes::INVALID_PARAMS => HubError::InvalidParams(message),
        _ => HubError::Protocol(format!("instance returned error {code}: {message}")),
    }
}
