//! Error handling module for the MCP gateway.
//!
//! This module defines the error types used throughout the crate. Every
//! operation that can fail returns a [`Result`], so callers match on the
//! specific failure kind (transport loss, protocol violation, timeout, ...)
//! instead of catching a generic error.
//!
//! # Example
//!
//! ```
//! use mcp_gateway::error::{Error, Result};
//!
//! fn describe(result: Result<()>) -> &'static str {
//!     match result {
//!         Ok(_) => "ok",
//!         Err(Error::ServerNotFound(_)) => "unknown server",
//!         Err(Error::NotRunning(_)) => "server is down",
//!         Err(e) if e.is_transport() => "pipe broke, restart candidate",
//!         Err(_) => "other failure",
//!     }
//! }
//! ```

use thiserror::Error;

/// Errors that can occur in the gateway.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to parse configuration from a file or string.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration parsed but contains invalid values.
    ///
    /// Never retried: a malformed entry stays malformed until edited.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The server executable could not be launched (missing, permission
    /// denied, bad working directory).
    #[error("Failed to spawn server process: {0}")]
    Spawn(String),

    /// The server did not answer `initialize` in time.
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(std::time::Duration),

    /// The handshake failed for another reason (process exited, error reply).
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// The stdio pipe to the server broke mid-conversation.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A malformed JSON-RPC frame was received in single-request mode.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server answered with a JSON-RPC error object.
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        /// JSON-RPC error code
        code: i64,
        /// Error message reported by the server
        message: String,
    },

    /// The restart policy refuses any further automatic restart.
    #[error("Restart limit exhausted for '{0}'")]
    RestartExhausted(String),

    /// Requested server id is not configured and has no instance state.
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// The server is known but has no live process.
    #[error("Server not running: {0}")]
    NotRunning(String),

    /// The server already has a live process.
    #[error("Server already running: {0}")]
    AlreadyRunning(String),

    /// Another lifecycle operation currently holds the server's lock.
    #[error("Operation in progress for '{0}'")]
    OperationInProgress(String),

    /// The process a caller acted on is no longer the one attached to the
    /// server; it was already replaced or detached by another operation.
    #[error("Process of '{0}' was replaced")]
    ProcessReplaced(String),

    /// A state change outside the documented lifecycle edges was requested.
    #[error("Invalid state transition for '{id}': {from} -> {to}")]
    InvalidTransition {
        /// Server id
        id: String,
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Operation timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Error in serializing or deserializing data.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The configuration store failed to load or persist data.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Metrics registration or rendering failed.
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// Any other error not covered by the above categories.
    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Whether this error means the stdio channel to the child is gone and the
    /// process should be considered for a restart.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<prometheus::Error> for Error {
    fn from(e: prometheus::Error) -> Self {
        Error::Metrics(e.to_string())
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;
