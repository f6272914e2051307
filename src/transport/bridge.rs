use super::json_rpc::JsonRpcRequest;
use super::stdio::{BridgeCommand, STDERR_TAIL_LINES, spawn_io};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::server::process::ProcessHandle;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

const STREAM_BUFFER: usize = 64;

/// Result of the MCP `initialize` exchange
#[derive(Debug, Clone, PartialEq)]
pub enum HandshakeOutcome {
    /// The server answered `initialize`; `notifications/initialized` was sent
    Ready {
        /// The `result` of the initialize response
        server_info: Value,
    },
    /// The process exited before answering
    Exited {
        /// Exit code if the process exited normally
        code: Option<i32>,
    },
    /// No answer before the deadline
    TimedOut,
    /// The server answered with a JSON-RPC error
    Rejected(String),
    /// The exchange failed for another reason
    Failed(String),
}

impl HandshakeOutcome {
    /// Whether the server is ready for requests
    pub fn is_ready(&self) -> bool {
        matches!(self, HandshakeOutcome::Ready { .. })
    }

    /// Human-readable failure reason
    pub fn reason(&self) -> String {
        match self {
            HandshakeOutcome::Ready { .. } => "ready".to_string(),
            HandshakeOutcome::Exited { code: Some(code) } => {
                format!("process exited with code {} during handshake", code)
            }
            HandshakeOutcome::Exited { code: None } => "process exited during handshake".to_string(),
            HandshakeOutcome::TimedOut => "handshake timed out".to_string(),
            HandshakeOutcome::Rejected(error) => format!("initialize rejected: {}", error),
            HandshakeOutcome::Failed(error) => error.clone(),
        }
    }

    /// Convert into a `Result`, mapping failures onto handshake errors
    pub fn into_result(self, timeout: Duration) -> Result<Value> {
        match self {
            HandshakeOutcome::Ready { server_info } => Ok(server_info),
            HandshakeOutcome::TimedOut => Err(Error::HandshakeTimeout(timeout)),
            other => Err(Error::HandshakeFailed(other.reason())),
        }
    }
}

/// One item of a streamed exchange
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A JSON-RPC message from the server
    Message(Value),
    /// A stdout line that was not JSON
    Raw(String),
    /// The exchange broke; no further events follow
    Failed(String),
}

/// JSON-RPC bridge to one MCP server over its stdio pipes.
///
/// Owns the [`ProcessHandle`]; dropping the bridge kills the process.
/// All exchanges are queued to a single worker task, so concurrent callers
/// are served one at a time in arrival order.
pub struct ProtocolBridge {
    process: ProcessHandle,
    commands: mpsc::Sender<BridgeCommand>,
    transport_lost: Arc<AtomicBool>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProtocolBridge {
    /// Spawn the server process and its I/O tasks. No handshake is performed.
    pub fn spawn(config: &ServerConfig) -> Result<Self> {
        let (process, pipes) = ProcessHandle::spawn(config)?;
        let transport_lost = Arc::new(AtomicBool::new(false));
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        let channels = spawn_io(
            &config.id,
            pipes.stdin,
            pipes.stdout,
            pipes.stderr,
            process.exit_watch(),
            Arc::clone(&transport_lost),
            Arc::clone(&stderr_tail),
        );

        Ok(Self {
            process,
            commands: channels.commands,
            transport_lost,
            stderr_tail,
            tasks: channels.tasks,
        })
    }

    /// Server id
    pub fn server_id(&self) -> &str {
        self.process.server_id()
    }

    /// OS process id
    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    /// Spawn time
    pub fn started_at(&self) -> DateTime<Utc> {
        self.process.started_at()
    }

    /// Whether the OS process is still running
    pub fn is_alive(&self) -> bool {
        !self.process.has_exited()
    }

    /// Exit code, once the process has exited
    pub fn exit_code(&self) -> Option<i32> {
        self.process.exit_info().and_then(|exit| exit.code)
    }

    /// Whether a pipe to the server has broken
    pub fn is_transport_lost(&self) -> bool {
        self.transport_lost.load(Ordering::SeqCst)
    }

    /// The most recent stderr lines, oldest first
    pub fn recent_stderr(&self) -> Vec<String> {
        self.stderr_tail
            .lock()
            .map(|tail| tail.iter().cloned().collect())
            .unwrap_or_default()
    }

    async fn submit(&self, command: BridgeCommand) -> Result<()> {
        self.commands.send(command).await.map_err(|_| {
            self.transport_lost.store(true, Ordering::SeqCst);
            Error::Transport("transport lost: bridge worker stopped".to_string())
        })
    }

    /// Perform the `initialize` exchange
    #[tracing::instrument(skip(self), fields(server_id = %self.server_id()))]
    pub async fn handshake(&self, timeout: Duration) -> HandshakeOutcome {
        let id = Value::String(Uuid::new_v4().to_string());
        let line = match serde_json::to_string(&JsonRpcRequest::initialize(id.clone())) {
            Ok(line) => line,
            Err(e) => return HandshakeOutcome::Failed(e.to_string()),
        };

        let (reply, outcome) = oneshot::channel();
        let command = BridgeCommand::Handshake {
            id,
            line,
            timeout,
            reply,
        };
        if let Err(e) = self.submit(command).await {
            return HandshakeOutcome::Failed(e.to_string());
        }

        let outcome = outcome
            .await
            .unwrap_or_else(|_| HandshakeOutcome::Failed("bridge worker stopped".to_string()));

        match &outcome {
            HandshakeOutcome::Ready { .. } => tracing::info!("Handshake complete"),
            other => tracing::warn!(reason = %other.reason(), "Handshake failed"),
        }
        outcome
    }

    /// Forward a JSON-RPC request and return the matching response verbatim.
    ///
    /// The payload must carry an `id`; use [`notify`](Self::notify) for
    /// notifications.
    pub async fn request(&self, payload: Value) -> Result<Value> {
        let id = payload
            .get("id")
            .cloned()
            .filter(|id| !id.is_null())
            .ok_or_else(|| Error::Protocol("request has no id".to_string()))?;
        let line = serde_json::to_string(&payload)?;

        let (reply, response) = oneshot::channel();
        self.submit(BridgeCommand::Request { id, line, reply }).await?;

        response.await.map_err(|_| {
            Error::Transport("transport lost: bridge worker stopped".to_string())
        })?
    }

    /// Issue a request with a generated id and return its `result`, mapping
    /// a JSON-RPC error response onto [`Error::JsonRpc`]
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let request = JsonRpcRequest::new(Uuid::new_v4().to_string(), method, params);
        let response = self.request(serde_json::to_value(&request)?).await?;

        if let Some(error) = response.get("error") {
            return Err(Error::JsonRpc {
                code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }

        response
            .get("result")
            .cloned()
            .ok_or_else(|| Error::Protocol("response has neither result nor error".to_string()))
    }

    /// Send a notification; no response is awaited
    pub async fn notify(&self, payload: Value) -> Result<()> {
        let line = serde_json::to_string(&payload)?;
        let (reply, written) = oneshot::channel();
        self.submit(BridgeCommand::Notify { line, reply }).await?;

        written.await.map_err(|_| {
            Error::Transport("transport lost: bridge worker stopped".to_string())
        })?
    }

    /// Forward a request and receive every line the server writes until the
    /// final response. Non-JSON lines arrive as [`StreamEvent::Raw`].
    pub async fn stream(&self, payload: Value) -> Result<mpsc::Receiver<StreamEvent>> {
        let id = payload.get("id").cloned().filter(|id| !id.is_null());
        let line = serde_json::to_string(&payload)?;
        let (sink, events) = mpsc::channel(STREAM_BUFFER);

        self.submit(BridgeCommand::Stream { id, line, sink }).await?;
        Ok(events)
    }

    /// Terminate the process and wait for it to be reaped
    #[tracing::instrument(skip(self), fields(server_id = %self.server_id()))]
    pub async fn shutdown(&self, grace: Duration, force: bool) -> Option<i32> {
        let code = self.process.terminate(grace, force).await;
        tracing::info!(exit_code = ?code, "Server process stopped");
        code
    }
}

impl Drop for ProtocolBridge {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
