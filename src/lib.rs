// Copyright (c) 2025 MCP Hub Contributors
// SPDX-License-Identifier: MIT

//! # MCP Hub
//!
//! A developer-workstation hub that multiplexes [Model Context Protocol
//! (MCP)](https://modelcontextprotocol.io/) traffic between AI clients
//! and a dynamic population of per-project MCP instance servers. The hub
//! exposes one stable MCP endpoint while the backing instances come and
//! go, crash, restart, or change ports.
//!
//! ## Architecture
//!
//! - [`net`]: resilience primitives — exponential backoff, circuit
//!   breaker, retry composition, transport-error classification, and a
//!   connectivity monitor whose events are pure hints
//! - [`instance`]: instance identity, the discovery-directory scan, and
//!   the per-instance resilient JSON-RPC client
//! - [`manager`]: the connection manager — single owner of all
//!   connection state, driven through a serialized command channel
//! - [`queue`]: in-memory pub/sub with TTL, bounded subscribers, and
//!   background reaping
//! - [`server`]: the streamable JSON-RPC server (POST batches + SSE),
//!   worker pools, and the prefix-routing proxy layer
//! - [`hub`]: the facade wiring everything together
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mcp_hub_rs::core::config::HubConfig;
//! use mcp_hub_rs::hub::Hub;
//!
//! #[tokio::main]
//! async fn main() -> mcp_hub_rs::core::error::HubResult<()> {
//!     mcp_hub_rs::core::logging::init_logging(tracing::Level::INFO);
//!
//!     let mut hub = Hub::new(HubConfig::from_env())
//!         .with_discovery_dir("/tmp/mcp-instances");
//!     let addr = hub.start().await?;
//!     println!("hub listening on {addr}");
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     hub.stop().await;
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod hub;
pub mod instance;
pub mod manager;
pub mod net;
pub mod protocol;
pub mod queue;
pub mod server;

// Re-export commonly used types for convenience
pub use crate::core::error::{HubError, HubResult};
pub use crate::protocol::types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::core::config::{ClientConfig, HubConfig, QueueConfig, ServerConfig};
    pub use crate::core::error::{HubError, HubResult};
    pub use crate::hub::Hub;
    pub use crate::instance::{Instance, InstanceClient};
    pub use crate::manager::{ConnectionManager, ConnectionState};
    pub use crate::net::{CircuitBreaker, CircuitState, ExponentialBackoff, RetryPolicy};
    pub use crate::protocol::messages::*;
    pub use crate::protocol::types::*;
    pub use crate::queue::{Message, MessageQueue};
    pub use crate::server::{HubRouter, StreamableServer};

    pub use serde_json::{Value, json};
    pub use std::collections::HashMap;
}
