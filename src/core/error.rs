//! Error types for the MCP hub
//!
//! Module defines all error types that can occur within the hub,
//! providing structured error handling with detailed context.

use thiserror::Error;

/// The main error type for the hub
#[derive(Error, Debug, Clone)]
pub enum HubError {
    /// Transport-related errors (connection, I/O, etc.)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol-level errors (invalid messages, unexpected responses, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Method not found (JSON-RPC error)
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Invalid parameters (JSON-RPC error)
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Connection-related errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Circuit breaker rejected the request without sending it
    #[error("Circuit breaker is open: {0}")]
    CircuitOpen(String),

    /// Target instance is unknown or not in the Active state
    #[error("Instance not connected: {0}")]
    InstanceNotConnected(String),

    /// Requested tool was not found on any instance
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Requested resource was not found on any instance
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Requested prompt was not found on any instance
    #[error("Prompt not found: {0}")]
    PromptNotFound(String),

    /// A bounded worker or subscriber queue refused the submission
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Subscription id is unknown or already cancelled
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// Response body exceeded the configured decode limit
    #[error("Response too large: {0}")]
    ResponseTooLarge(String),

    /// Input validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// I/O errors from the standard library
    #[error("I/O error: {0}")]
    Io(String),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(String),

    /// HTTP-related errors from the instance transport
    #[error("HTTP error: {0}")]
    Http(String),

    /// Timeout errors
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Cancellation errors
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Internal errors that shouldn't normally occur
    #[error("Internal error: {0}")]
    Internal(String),
}

// Manual From implementations for types that don't implement Clone
impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for HubError {
    fn from(err: std::io::Error) -> Self {
        HubError::Io(err.to_string())
    }
}

impl From<url::ParseError> for HubError {
    fn from(err: url::ParseError) -> Self {
        HubError::Url(err.to_string())
    }
}

impl From<reqwest::Error> for HubError {
    fn from(err: reqwest::Error) -> Self {
        HubError::Http(err.to_string())
    }
}

/// Result type alias for hub operations
pub type HubResult<T> = Result<T, HubError>;

impl HubError {
    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol(message.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation(message.into())
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection(message.into())
    }

    /// Create a circuit-open error
    pub fn circuit_open<S: Into<String>>(message: S) -> Self {
        Self::CircuitOpen(message.into())
    }

    /// Create an instance-not-connected error
    pub fn not_connected<S: Into<String>>(instance_id: S) -> Self {
        Self::InstanceNotConnected(instance_id.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout(message.into())
    }

    /// Create a queue-full error
    pub fn queue_full<S: Into<String>>(message: S) -> Self {
        Self::QueueFull(message.into())
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            HubError::Connection(_) => true,
            HubError::Timeout(_) => true,
            HubError::Io(_) => true,
            HubError::Http(_) => true,
            HubError::QueueFull(_) => true,
            HubError::InstanceNotConnected(_) => true,
            HubError::CircuitOpen(_) => false,
            HubError::Transport(_) => false,
            HubError::Protocol(_) => false,
            HubError::Serialization(_) => false,
            HubError::MethodNotFound(_) => false,
            HubError::InvalidParams(_) => false,
            HubError::ToolNotFound(_) => false,
            HubError::ResourceNotFound(_) => false,
            HubError::PromptNotFound(_) => false,
            HubError::SubscriptionNotFound(_) => false,
            HubError::ResponseTooLarge(_) => false,
            HubError::Validation(_) => false,
            HubError::Url(_) => false,
            HubError::Cancelled(_) => false,
            HubError::Internal(_) => false,
        }
    }

    /// Get the error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            HubError::Transport(_) => "transport",
            HubError::Protocol(_) => "protocol",
            HubError::Serialization(_) => "serialization",
            HubError::MethodNotFound(_) => "not_found",
            HubError::InvalidParams(_) => "validation",
            HubError::Connection(_) => "connection",
            HubError::CircuitOpen(_) => "circuit",
            HubError::InstanceNotConnected(_) => "lifecycle",
            HubError::ToolNotFound(_) => "not_found",
            HubError::ResourceNotFound(_) => "not_found",
            HubError::PromptNotFound(_) => "not_found",
            HubError::QueueFull(_) => "lifecycle",
            HubError::SubscriptionNotFound(_) => "lifecycle",
            HubError::ResponseTooLarge(_) => "transport",
            HubError::Validation(_) => "validation",
            HubError::Io(_) => "io",
            HubError::Url(_) => "validation",
            HubError::Http(_) => "http",
            HubError::Timeout(_) => "timeout",
            HubError::Cancelled(_) => "cancelled",
            HubError::Internal(_) => "internal",
        }
    }

    /// JSON-RPC error code the error maps to at the server boundary
    pub fn json_rpc_code(&self) -> i32 {
        use crate::protocol::types::error_codes;
        match self {
            HubError::MethodNotFound(_) => error_codes::METHOD_NOT_FOUND,
            HubError::InvalidParams(_) | HubError::Validation(_) => error_codes::INVALID_PARAMS,
            HubError::Serialization(_) => error_codes::PARSE_ERROR,
            HubError::Internal(_) => error_codes::INTERNAL_ERROR,
            _ => error_codes::APPLICATION_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = HubError::transport("Connection failed");
        assert_eq!(error.to_string(), "Transport error: Connection failed");
        assert_eq!(error.category(), "transport");
        assert!(!error.is_recoverable());
    }

    #[test]
    fn test_error_recovery() {
        assert!(HubError::connection("timeout").is_recoverable());
        assert!(!HubError::validation("invalid input").is_recoverable());
        assert!(HubError::timeout("request timeout").is_recoverable());
        assert!(!HubError::circuit_open("instance-1").is_recoverable());
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(HubError::protocol("bad message").category(), "protocol");
        assert_eq!(
            HubError::not_connected("missing-instance").category(),
            "lifecycle"
        );
        assert_eq!(
            HubError::queue_full("notifications").category(),
            "lifecycle"
        );
    }

    #[test]
    fn test_json_rpc_codes() {
        assert_eq!(
            HubError::MethodNotFound("nope".to_string()).json_rpc_code(),
            -32601
        );
        assert_eq!(
            HubError::InvalidParams("bad".to_string()).json_rpc_code(),
            -32602
        );
        assert_eq!(HubError::internal("boom").json_rpc_code(), -32603);
        assert_eq!(HubError::not_connected("i1").json_rpc_code(), -32000);
    }
}
