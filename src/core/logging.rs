//! Structured logging for the hub
//!
//! Process-wide `tracing` initialization plus the error-context value
//! threaded through retries and request handling. The log level is fixed
//! at startup; there is no runtime debug toggle.

use std::collections::HashMap;

use once_cell::sync::OnceCell;
use serde_json::Value;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::core::error::HubError;

static LOG_INIT: OnceCell<()> = OnceCell::new();

/// Initialize process-wide logging.
///
/// `level` is the default filter when `MCP_HUB_LOG` is not set. Safe to
/// call more than once; only the first call installs a subscriber.
pub fn init_logging(level: Level) {
    LOG_INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_env("MCP_HUB_LOG")
            .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}

/// Extended error context carried through retries and request handling
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Operation being performed when the error occurred
    pub operation: String,
    /// Request method if applicable
    pub method: Option<String>,
    /// Instance the operation targeted
    pub instance_id: Option<String>,
    /// Session or connection ID
    pub session_id: Option<String>,
    /// Additional context data
    pub extra: HashMap<String, Value>,
}

impl ErrorContext {
    /// Create a new error context
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    /// Set method name
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    /// Set the target instance
    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Set session ID
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Add extra context data
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Log an error with its context at a severity derived from the error
pub fn log_error(err: &HubError, context: &ErrorContext) {
    let category = err.category();
    let recoverable = err.is_recoverable();
    let instance = context.instance_id.as_deref().unwrap_or("-");
    match err {
        HubError::Internal(_) | HubError::Transport(_) | HubError::Protocol(_) => {
            error!(
                operation = %context.operation,
                category,
                recoverable,
                instance,
                "{err}"
            );
        }
        HubError::Connection(_) | HubError::Timeout(_) | HubError::Http(_) | HubError::Io(_) => {
            warn!(
                operation = %context.operation,
                category,
                recoverable,
                instance,
                "{err}"
            );
        }
        _ => {
            info!(
                operation = %context.operation,
                category,
                recoverable,
                instance,
                "{err}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_builder() {
        let ctx = ErrorContext::new("connect")
            .with_method("initialize")
            .with_instance("dev-server")
            .with_extra("attempt", 2);

        assert_eq!(ctx.operation, "connect");
        assert_eq!(ctx.method.as_deref(), Some("initialize"));
        assert_eq!(ctx.instance_id.as_deref(), Some("dev-server"));
        assert_eq!(ctx.extra.get("attempt"), Some(&Value::from(2)));
    }

    #[test]
    fn test_init_logging_idempotent() {
        init_logging(Level::DEBUG);
        init_logging(Level::ERROR);
    }

    #[test]
    fn test_log_error_does_not_panic() {
        let ctx = ErrorContext::new("test").with_session_id("s1");
        log_error(&HubError::internal("boom"), &ctx);
        log_error(&HubError::connection("refused"), &ctx);
        log_error(&HubError::validation("bad"), &ctx);
    }
}
