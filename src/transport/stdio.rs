//! Confined stdio worker for one child process.
//!
//! Three tasks are spawned per child. A pump turns stdout into lines on a
//! channel, a drain logs stderr and keeps its tail, and the worker owns stdin
//! plus the line receiver. The worker executes [`BridgeCommand`]s strictly
//! one at a time, so no two exchanges ever interleave on the pipes.

use super::bridge::{HandshakeOutcome, StreamEvent};
use super::json_rpc::{JsonRpcNotification, is_notification, is_response};
use crate::error::{Error, Result};
use crate::server::process::{ExitInfo, wait_for_exit};
use async_process::{ChildStderr, ChildStdin, ChildStdout};
use futures_lite::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Lines of stderr retained per child
pub const STDERR_TAIL_LINES: usize = 50;

/// Non-JSON handshake lines that get logged before going quiet
const MAX_LOGGED_NOISE: usize = 20;

/// How long to wait for the exit status once stdout has closed
const EXIT_SETTLE: Duration = Duration::from_secs(1);

const LINE_BUFFER: usize = 256;
const COMMAND_BUFFER: usize = 64;

/// Work item executed by the worker
pub(crate) enum BridgeCommand {
    Handshake {
        id: Value,
        line: String,
        timeout: Duration,
        reply: oneshot::Sender<HandshakeOutcome>,
    },
    Request {
        id: Value,
        line: String,
        reply: oneshot::Sender<Result<Value>>,
    },
    Stream {
        id: Option<Value>,
        line: String,
        sink: mpsc::Sender<StreamEvent>,
    },
    Notify {
        line: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Handles on the per-child I/O tasks
pub(crate) struct StdioChannels {
    pub commands: mpsc::Sender<BridgeCommand>,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Spawn the stdout pump, stderr drain and command worker for a child
pub(crate) fn spawn_io(
    server_id: &str,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: ChildStderr,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    transport_lost: Arc<AtomicBool>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
) -> StdioChannels {
    let (line_tx, line_rx) = mpsc::channel(LINE_BUFFER);
    let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);

    let pump = tokio::spawn(pump_stdout(server_id.to_string(), stdout, line_tx));
    let drain = tokio::spawn(drain_stderr(server_id.to_string(), stderr, stderr_tail));

    let worker = IoWorker {
        server_id: server_id.to_string(),
        stdin,
        lines: line_rx,
        exit_rx,
        transport_lost,
    };
    let worker = tokio::spawn(worker.run(command_rx));

    StdioChannels {
        commands: command_tx,
        tasks: vec![pump, drain, worker],
    }
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(['\r', '\n'])
        .to_string()
}

async fn pump_stdout(server_id: String, stdout: ChildStdout, lines: mpsc::Sender<String>) {
    let mut reader = BufReader::new(stdout);
    let mut buffer = Vec::new();

    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) => break,
            Ok(_) => {
                if lines.send(decode_line(&buffer)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(server_id = %server_id, error = %e, "Error reading server stdout");
                break;
            }
        }
    }

    tracing::debug!(server_id = %server_id, "Server stdout closed");
}

async fn drain_stderr(server_id: String, stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut reader = BufReader::new(stderr);
    let mut buffer = Vec::new();

    loop {
        buffer.clear();
        match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = decode_line(&buffer);
                tracing::debug!(server_id = %server_id, stderr = %line, "Server stderr");
                if let Ok(mut tail) = tail.lock() {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
        }
    }
}

struct IoWorker {
    server_id: String,
    stdin: ChildStdin,
    lines: mpsc::Receiver<String>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    transport_lost: Arc<AtomicBool>,
}

impl IoWorker {
    async fn run(mut self, mut commands: mpsc::Receiver<BridgeCommand>) {
        while let Some(command) = commands.recv().await {
            match command {
                BridgeCommand::Handshake {
                    id,
                    line,
                    timeout,
                    reply,
                } => {
                    let outcome = self.handshake(&id, &line, timeout).await;
                    let _ = reply.send(outcome);
                }
                BridgeCommand::Request { id, line, reply } => {
                    let result = self.request(&id, &line).await;
                    // A dropped receiver means the caller timed out; the
                    // response has still been consumed
                    let _ = reply.send(result);
                }
                BridgeCommand::Stream { id, line, sink } => {
                    self.stream(id.as_ref(), &line, sink).await;
                }
                BridgeCommand::Notify { line, reply } => {
                    let _ = reply.send(self.write_line(&line).await);
                }
            }
        }

        tracing::debug!(server_id = %self.server_id, "Bridge worker stopped");
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let mut frame = Vec::with_capacity(line.len() + 1);
        frame.extend_from_slice(line.as_bytes());
        frame.push(b'\n');

        let written = match self.stdin.write_all(&frame).await {
            Ok(()) => self.stdin.flush().await,
            Err(e) => Err(e),
        };

        written.map_err(|e| {
            self.transport_lost.store(true, Ordering::SeqCst);
            tracing::warn!(server_id = %self.server_id, error = %e, "Write to server stdin failed");
            Error::Transport(format!("transport lost: {}", e))
        })
    }

    async fn next_line(&mut self) -> Result<String> {
        match self.lines.recv().await {
            Some(line) => Ok(line),
            None => {
                self.transport_lost.store(true, Ordering::SeqCst);
                Err(Error::Transport(
                    "transport lost: server stdout closed".to_string(),
                ))
            }
        }
    }

    async fn settled_exit(&self) -> Option<ExitInfo> {
        tokio::time::timeout(EXIT_SETTLE, wait_for_exit(self.exit_rx.clone()))
            .await
            .ok()
    }

    async fn handshake(&mut self, id: &Value, line: &str, timeout: Duration) -> HandshakeOutcome {
        let deadline = tokio::time::Instant::now() + timeout;

        if let Err(e) = self.write_line(line).await {
            return match self.settled_exit().await {
                Some(exit) => HandshakeOutcome::Exited { code: exit.code },
                None => HandshakeOutcome::Failed(e.to_string()),
            };
        }

        let mut noise = 0usize;
        loop {
            let next = tokio::select! {
                line = self.lines.recv() => line,
                _ = tokio::time::sleep_until(deadline) => return HandshakeOutcome::TimedOut,
            };

            let Some(line) = next else {
                self.transport_lost.store(true, Ordering::SeqCst);
                let code = self.settled_exit().await.and_then(|exit| exit.code);
                return HandshakeOutcome::Exited { code };
            };

            if line.trim().is_empty() {
                continue;
            }

            let message: Value = match serde_json::from_str(&line) {
                Ok(message) => message,
                Err(_) => {
                    noise += 1;
                    if noise <= MAX_LOGGED_NOISE {
                        tracing::debug!(server_id = %self.server_id, line = %line, "Skipping non-JSON output during handshake");
                    } else if noise == MAX_LOGGED_NOISE + 1 {
                        tracing::debug!(server_id = %self.server_id, "Further non-JSON output suppressed");
                    }
                    continue;
                }
            };

            if message.get("id") != Some(id) {
                tracing::debug!(server_id = %self.server_id, "Skipping unrelated message during handshake");
                continue;
            }

            if let Some(error) = message.get("error") {
                return HandshakeOutcome::Rejected(error.to_string());
            }

            if let Some(result) = message.get("result") {
                let initialized = match serde_json::to_string(&JsonRpcNotification::initialized()) {
                    Ok(initialized) => initialized,
                    Err(e) => return HandshakeOutcome::Failed(e.to_string()),
                };
                if let Err(e) = self.write_line(&initialized).await {
                    return HandshakeOutcome::Failed(e.to_string());
                }
                return HandshakeOutcome::Ready {
                    server_info: result.clone(),
                };
            }
        }
    }

    async fn request(&mut self, id: &Value, line: &str) -> Result<Value> {
        self.write_line(line).await?;

        loop {
            let line = self.next_line().await?;
            if line.trim().is_empty() {
                continue;
            }

            let message: Value = serde_json::from_str(&line)
                .map_err(|e| Error::Protocol(format!("invalid JSON from server: {}", e)))?;

            if is_notification(&message) {
                tracing::debug!(server_id = %self.server_id, method = ?message.get("method"), "Skipping server notification");
                continue;
            }

            if message.get("method").is_some() {
                tracing::debug!(server_id = %self.server_id, method = ?message.get("method"), "Ignoring server-initiated request");
                continue;
            }

            if message.get("id") != Some(id) {
                tracing::warn!(server_id = %self.server_id, stale_id = ?message.get("id"), "Discarding response for an earlier request");
                continue;
            }

            return Ok(message);
        }
    }

    async fn stream(&mut self, id: Option<&Value>, line: &str, sink: mpsc::Sender<StreamEvent>) {
        if let Err(e) = self.write_line(line).await {
            let _ = sink.send(StreamEvent::Failed(e.to_string())).await;
            return;
        }

        let mut client_gone = false;
        loop {
            let line = match self.next_line().await {
                Ok(line) => line,
                Err(e) => {
                    let _ = sink.send(StreamEvent::Failed(e.to_string())).await;
                    return;
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            let (event, terminal) = match serde_json::from_str::<Value>(&line) {
                Ok(message) => {
                    let terminal = is_response(&message)
                        && id.is_none_or(|id| message.get("id") == Some(id));
                    (StreamEvent::Message(message), terminal)
                }
                Err(_) => (StreamEvent::Raw(line), false),
            };

            // Keep reading after the client leaves so the next exchange
            // starts on a clean pipe
            if !client_gone && sink.send(event).await.is_err() {
                tracing::debug!(server_id = %self.server_id, "Stream client disconnected, draining");
                client_gone = true;
            }

            if terminal {
                return;
            }
        }
    }
}
