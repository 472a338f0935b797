//! Core abstractions shared across the hub: errors, configuration,
//! logging, and metrics.

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;

pub use config::{ClientConfig, HubConfig, QueueConfig, ServerConfig};
pub use error::{HubError, HubResult};
pub use logging::{ErrorContext, init_logging};
pub use metrics::{MetricsCollector, global_metrics};
