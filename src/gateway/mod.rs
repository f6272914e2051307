//! HTTP front end of the gateway, built on Actix Web.
//!
//! Clients address a server by id in the path. JSON-RPC is proxied
//! synchronously (`/{id}/mcp`) or streamed as Server-Sent Events
//! (`/{id}/sse`); lifecycle control, health and Prometheus metrics live
//! under `/servers`, `/health` and `/metrics`.

pub use self::router::GatewayRouter;
pub use self::server::{GatewayHandle, configure, start};
pub use self::types::{GatewayHealth, LifecycleResponse, SSEMessage, ToolCallRequest};

pub mod actix_error;
pub mod handlers;
pub mod router;
pub mod server;
pub mod types;
