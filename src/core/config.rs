//! Hub configuration
//!
//! Typed configuration for the client, queue, and server planes with the
//! defaults recognized by the hub. Environment variables prefixed
//! `MCP_HUB_` override individual knobs at load time.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment flag selecting the persistent, pooled instance client
pub const ROBUST_NETWORKING_ENV: &str = "MCP_HUB_USE_ROBUST_NETWORKING";

/// Per-instance client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Connection timeout for initial TCP/TLS setup
    pub connect_timeout_ms: u64,
    /// Default per-request deadline when the caller supplies none
    pub request_timeout_ms: u64,
    /// Maximum retry attempts per send
    pub max_retries: u32,
    /// Initial retry delay
    pub retry_delay_ms: u64,
    /// Exponential backoff multiplier
    pub retry_backoff: f64,
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Time the circuit stays open before probing
    pub recovery_timeout_ms: u64,
    /// Successes required in HalfOpen before closing
    pub half_open_successes: u32,
    /// Maximum idle connections in the pool
    pub max_idle_conns: usize,
    /// Maximum connections per host
    pub max_conns_per_host: usize,
    /// Idle connection timeout for the non-persistent variant
    pub idle_conn_timeout_ms: u64,
    /// Disable HTTP keep-alives entirely
    pub disable_keep_alives: bool,
    /// Maximum decoded response body size in bytes
    pub max_response_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            request_timeout_ms: 30_000,
            max_retries: 3,
            retry_delay_ms: 100,
            retry_backoff: 2.0,
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            half_open_successes: 3,
            max_idle_conns: 10,
            max_conns_per_host: 2,
            idle_conn_timeout_ms: 90_000,
            disable_keep_alives: false,
            max_response_bytes: 10 * 1024 * 1024,
        }
    }
}

impl ClientConfig {
    /// Default request deadline as a `Duration`
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Connect timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Message queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// TTL applied when a message is sent with ttl ≤ 0
    pub default_ttl_seconds: i64,
    /// Interval between expired-message reaps
    pub cleanup_interval_ms: u64,
    /// Bounded capacity of each subscriber delivery queue
    pub subscriber_capacity: usize,
    /// Default limit for receive when the caller passes 0
    pub default_receive_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 3_600,
            cleanup_interval_ms: 10_000,
            subscriber_capacity: 100,
            default_receive_limit: 100,
        }
    }
}

/// Streamable server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port to bind; the next free port is used when occupied
    pub port: u16,
    /// SSE heartbeat interval
    pub heartbeat_interval_ms: u64,
    /// Window over which resource-update notifications are coalesced
    pub update_aggregation_ms: u64,
    /// Notification worker pool size
    pub notification_workers: usize,
    /// Notification pool queue capacity
    pub notification_queue: usize,
    /// Event worker pool size
    pub event_workers: usize,
    /// Event pool queue capacity
    pub event_queue: usize,
    /// Shutdown grace period
    pub shutdown_grace_ms: u64,
    /// Per-session send timeout during broadcast
    pub session_send_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 7777,
            heartbeat_interval_ms: 30_000,
            update_aggregation_ms: 100,
            notification_workers: 10,
            notification_queue: 100,
            event_workers: 5,
            event_queue: 50,
            shutdown_grace_ms: 5_000,
            session_send_timeout_ms: 5_000,
        }
    }
}

/// Top-level hub configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HubConfig {
    /// Select the persistent, pooled instance client
    pub use_robust_networking: bool,
    pub client: ClientConfig,
    pub queue: QueueConfig,
    pub server: ServerConfig,
}

impl HubConfig {
    /// Load configuration from defaults plus environment overrides
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var(ROBUST_NETWORKING_ENV) {
            config.use_robust_networking = v.eq_ignore_ascii_case("true") || v == "1";
        }
        if let Some(port) = env_parse::<u16>("MCP_HUB_PORT") {
            config.server.port = port;
        }
        if let Some(ms) = env_parse::<u64>("MCP_HUB_REQUEST_TIMEOUT_MS") {
            config.client.request_timeout_ms = ms;
        }
        if let Some(n) = env_parse::<u32>("MCP_HUB_MAX_RETRIES") {
            config.client.max_retries = n;
        }
        if let Some(ttl) = env_parse::<i64>("MCP_HUB_QUEUE_TTL_SECONDS") {
            config.queue.default_ttl_seconds = ttl;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.half_open_successes, 3);
        assert_eq!(config.max_conns_per_host, 2);
        assert_eq!(config.max_response_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn test_queue_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.default_ttl_seconds, 3_600);
        assert_eq!(config.cleanup_interval_ms, 10_000);
        assert_eq!(config.subscriber_capacity, 100);
        assert_eq!(config.default_receive_limit, 100);
    }

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.heartbeat_interval_ms, 30_000);
        assert_eq!(config.update_aggregation_ms, 100);
        assert_eq!(config.notification_workers, 10);
        assert_eq!(config.event_workers, 5);
        assert_eq!(config.notification_queue, 100);
        assert_eq!(config.event_queue, 50);
        assert_eq!(config.shutdown_grace_ms, 5_000);
    }

    #[test]
    fn test_robust_networking_env_flag() {
        // Rebuilding from env must honor the flag when present.
        unsafe { std::env::set_var(ROBUST_NETWORKING_ENV, "true") };
        let config = HubConfig::from_env();
        assert!(config.use_robust_networking);
        unsafe { std::env::remove_var(ROBUST_NETWORKING_ENV) };
    }
}
