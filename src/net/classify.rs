//! Transport error classification
//!
//! Maps raw transport failures (reqwest/io errors, HTTP statuses) to a
//! semantic `NetworkError` carrying retryability and a suggested delay.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::error::HubError;

/// Semantic category of a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    ConnRefused,
    Timeout,
    Dns,
    NetworkUnreachable,
    ConnReset,
    ProcessNotFound,
    PermissionDenied,
    HostUnreachable,
    NoRoute,
    TlsHandshake,
    Protocol,
    ContextCancelled,
    ContextDeadline,
    Unknown,
}

impl NetworkErrorKind {
    /// Suggested delay before the next attempt
    pub fn retry_after(&self) -> Duration {
        match self {
            NetworkErrorKind::Timeout => Duration::from_secs(5),
            NetworkErrorKind::ConnRefused => Duration::from_secs(10),
            NetworkErrorKind::NetworkUnreachable => Duration::from_secs(15),
            NetworkErrorKind::HostUnreachable => Duration::from_secs(30),
            NetworkErrorKind::NoRoute => Duration::from_secs(30),
            NetworkErrorKind::Dns => Duration::from_secs(10),
            NetworkErrorKind::ConnReset => Duration::from_secs(2),
            NetworkErrorKind::Protocol => Duration::from_secs(5),
            NetworkErrorKind::ProcessNotFound
            | NetworkErrorKind::PermissionDenied
            | NetworkErrorKind::TlsHandshake
            | NetworkErrorKind::ContextCancelled
            | NetworkErrorKind::ContextDeadline => Duration::ZERO,
            NetworkErrorKind::Unknown => Duration::from_secs(30),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            NetworkErrorKind::ConnRefused => "connection_refused",
            NetworkErrorKind::Timeout => "timeout",
            NetworkErrorKind::Dns => "dns",
            NetworkErrorKind::NetworkUnreachable => "network_unreachable",
            NetworkErrorKind::ConnReset => "connection_reset",
            NetworkErrorKind::ProcessNotFound => "process_not_found",
            NetworkErrorKind::PermissionDenied => "permission_denied",
            NetworkErrorKind::HostUnreachable => "host_unreachable",
            NetworkErrorKind::NoRoute => "no_route",
            NetworkErrorKind::TlsHandshake => "tls_handshake",
            NetworkErrorKind::Protocol => "protocol",
            NetworkErrorKind::ContextCancelled => "cancelled",
            NetworkErrorKind::ContextDeadline => "deadline_exceeded",
            NetworkErrorKind::Unknown => "unknown",
        }
    }
}

/// Classified transport failure
#[derive(Debug, Clone)]
pub struct NetworkError {
    pub kind: NetworkErrorKind,
    /// Underlying error text
    pub message: String,
    /// Whether the failure is a connection-level transient
    pub temporary: bool,
    /// Suggested delay before the next attempt
    pub retry_after: Duration,
    /// Operation the error occurred in
    pub context: Option<String>,
    /// Instance the operation targeted
    pub instance_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl NetworkError {
    fn new(kind: NetworkErrorKind, message: impl Into<String>, temporary: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            temporary,
            retry_after: kind.retry_after(),
            context: None,
            instance_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach the operation name
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Attach the target instance
    pub fn with_instance(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Override the suggested retry delay
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = delay;
        self
    }

    /// Whether a retry loop should attempt again
    pub fn should_retry(&self) -> bool {
        self.temporary
            && !matches!(
                self.kind,
                NetworkErrorKind::ContextCancelled
                    | NetworkErrorKind::ContextDeadline
                    | NetworkErrorKind::PermissionDenied
                    | NetworkErrorKind::ProcessNotFound
                    | NetworkErrorKind::Protocol
            )
    }

    /// Classify a reqwest error, optionally with the HTTP status observed
    pub fn from_reqwest(err: &reqwest::Error, status: Option<u16>) -> Self {
        if let Some(code) = status.or_else(|| err.status().map(|s| s.as_u16())) {
            return Self::from_status(code, err.to_string());
        }

        if err.is_timeout() {
            return Self::new(NetworkErrorKind::Timeout, err.to_string(), true);
        }

        let message = full_error_chain(err);
        if err.is_connect() {
            return Self::from_message(&message);
        }
        if err.is_request() && message.contains("builder") {
            return Self::new(NetworkErrorKind::Protocol, message, false);
        }
        Self::from_message(&message)
    }

    /// Classify from an HTTP status code
    pub fn from_status(code: u16, message: String) -> Self {
        match code {
            429 => Self::new(NetworkErrorKind::Protocol, message, true)
                .with_retry_after(Duration::from_secs(30)),
            500..=599 => Self::new(NetworkErrorKind::Protocol, message, true)
                .with_retry_after(Duration::from_secs(5)),
            400..=499 => Self::new(NetworkErrorKind::Protocol, message, false),
            _ => Self::new(NetworkErrorKind::Unknown, message, true),
        }
    }

    /// Classify a std::io error
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        let message = err.to_string();
        match err.kind() {
            ErrorKind::ConnectionRefused => {
                Self::new(NetworkErrorKind::ConnRefused, message, true)
            }
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                Self::new(NetworkErrorKind::ConnReset, message, true)
            }
            ErrorKind::TimedOut => Self::new(NetworkErrorKind::Timeout, message, true),
            ErrorKind::PermissionDenied => {
                Self::new(NetworkErrorKind::PermissionDenied, message, false)
            }
            ErrorKind::NotFound => Self::new(NetworkErrorKind::ProcessNotFound, message, false),
            ErrorKind::HostUnreachable => {
                Self::new(NetworkErrorKind::HostUnreachable, message, true)
            }
            ErrorKind::NetworkUnreachable => {
                Self::new(NetworkErrorKind::NetworkUnreachable, message, true)
            }
            _ => Self::from_message(&message),
        }
    }

    /// Pattern-match an error message when no structured cause is available
    pub fn from_message(message: &str) -> Self {
        let lower = message.to_lowercase();

        if lower.contains("connection refused") {
            Self::new(NetworkErrorKind::ConnRefused, message, true)
        } else if lower.contains("connection reset") || lower.contains("broken pipe") {
            Self::new(NetworkErrorKind::ConnReset, message, true)
        } else if lower.contains("timed out") || lower.contains("timeout") {
            Self::new(NetworkErrorKind::Timeout, message, true)
        } else if lower.contains("dns") || lower.contains("failed to lookup") {
            Self::new(NetworkErrorKind::Dns, message, true)
        } else if lower.contains("network is unreachable") || lower.contains("network unreachable")
        {
            Self::new(NetworkErrorKind::NetworkUnreachable, message, true)
        } else if lower.contains("no route to host") {
            Self::new(NetworkErrorKind::NoRoute, message, true)
        } else if lower.contains("host is unreachable") || lower.contains("host unreachable") {
            Self::new(NetworkErrorKind::HostUnreachable, message, true)
        } else if lower.contains("permission denied") {
            Self::new(NetworkErrorKind::PermissionDenied, message, false)
        } else if lower.contains("no such process") || lower.contains("process not found") {
            Self::new(NetworkErrorKind::ProcessNotFound, message, false)
        } else if lower.contains("tls") || lower.contains("certificate") || lower.contains("ssl") {
            Self::new(NetworkErrorKind::TlsHandshake, message, false)
        } else if lower.contains("cancelled") || lower.contains("canceled") {
            Self::new(NetworkErrorKind::ContextCancelled, message, false)
        } else if lower.contains("deadline") {
            Self::new(NetworkErrorKind::ContextDeadline, message, false)
        } else {
            Self::new(NetworkErrorKind::Unknown, message, true)
        }
    }

    /// A deadline expiry raised by the hub's own timeout wrapper
    pub fn deadline(message: impl Into<String>) -> Self {
        Self::new(NetworkErrorKind::Timeout, message, true)
    }

    /// A caller-initiated cancellation
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(NetworkErrorKind::ContextCancelled, message, false)
    }
}

impl From<NetworkError> for HubError {
    fn from(err: NetworkError) -> Self {
        match err.kind {
            NetworkErrorKind::Timeout | NetworkErrorKind::ContextDeadline => {
                HubError::Timeout(err.to_string())
            }
            NetworkErrorKind::ContextCancelled => HubError::Cancelled(err.to_string()),
            NetworkErrorKind::Protocol => HubError::Http(err.to_string()),
            _ => HubError::Connection(err.to_string()),
        }
    }
}

// reqwest wraps the interesting io error several levels deep.
fn full_error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
