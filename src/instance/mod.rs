//! Instance identity and discovery input
//!
//! An [`Instance`] is a per-project MCP server discovered on the
//! workstation. Values are immutable once registered; a restart produces
//! a new value even when the ID is reused.

pub mod client;
pub mod discovery;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::error::{HubError, HubResult};

pub use client::{ClientMetrics, InstanceClient};
pub use discovery::{DiscoveryDelta, scan_instances_dir};

// Instance IDs are embedded into hub tool names, which clients validate
// against this pattern.
static NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]{1,128}$").expect("static pattern"));

/// A discovered per-project MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Opaque identifier, unique among live instances
    pub id: String,
    /// Display name
    pub name: String,
    /// Working directory of the project
    pub directory: String,
    /// Listening port on localhost
    pub port: u16,
    /// Owning OS process
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// When discovery first saw this instance
    #[serde(default = "Utc::now")]
    pub discovered_at: DateTime<Utc>,
}

impl Instance {
    /// Create an instance record, validating the ID against the
    /// client-compatibility pattern.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        directory: impl Into<String>,
        port: u16,
    ) -> HubResult<Self> {
        let id = id.into();
        validate_instance_id(&id)?;
        Ok(Self {
            id,
            name: name.into(),
            directory: directory.into(),
            port,
            pid: None,
            discovered_at: Utc::now(),
        })
    }

    /// Set the owning process ID
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    /// Base URL of the instance's MCP endpoint
    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

/// Validate an instance ID against `^[a-zA-Z0-9_-]{1,128}$`
pub fn validate_instance_id(id: &str) -> HubResult<()> {
    if NAME_PATTERN.is_match(id) {
        Ok(())
    } else {
        Err(HubError::validation(format!(
            "instance id {id:?} must match ^[a-zA-Z0-9_-]{{1,128}}$"
        )))
    }
}

/// Validate a hub-exposed tool name against the same pattern
pub fn validate_tool_name(name: &str) -> bool {
    NAME_PATTERN.is_match(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ids() {
        for id in ["dev-server", "build_42", "a", "A-b_C-9"] {
            assert!(validate_instance_id(id).is_ok(), "id: {id}");
        }
    }

    #[test]
    fn test_invalid_ids() {
        let too_long = "x".repeat(129);
        for id in ["", "has space", "slash/y", "dot.name", too_long.as_str()] {
            assert!(validate_instance_id(id).is_err(), "id: {id}");
        }
    }

    #[test]
    fn test_instance_construction() {
        let instance = Instance::new("dev-server", "Dev Server", "/work/app", 3100)
            .unwrap()
            .with_pid(4242);
        assert_eq!(instance.base_url(), "http://127.0.0.1:3100");
        assert_eq!(instance.pid, Some(4242));
    }

    #[test]
    fn test_bad_id_rejected_at_construction() {
        assert!(Instance::new("bad id", "x", "/tmp", 1).is_err());
    }
}
