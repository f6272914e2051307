//! Stdio transport to MCP server processes.
//!
//! [`ProtocolBridge`] is the only way the rest of the gateway talks to a
//! child: it owns the process and funnels every JSON-RPC exchange through a
//! dedicated worker task.

mod bridge;
mod json_rpc;
mod stdio;

pub use bridge::{HandshakeOutcome, ProtocolBridge, StreamEvent};
pub use json_rpc::{
    JSON_RPC_VERSION, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    MCP_PROTOCOL_VERSION, error_codes, is_notification, is_response,
};
pub use stdio::STDERR_TAIL_LINES;
