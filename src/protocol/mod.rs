//! MCP protocol types and message definitions (2024-11-05)

pub mod messages;
pub mod types;

pub use messages::methods;
pub use types::{
    JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    PROTOCOL_VERSION, error_codes,
};
