// src/server/process.rs
use crate::config::{EnvVar, ServerConfig};
use crate::error::{Error, Result};
use async_process::{ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// How a child process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code; `None` when the process was killed by a signal
    pub code: Option<i32>,
    /// When the exit was observed
    pub at: DateTime<Utc>,
}

/// Pipes of a freshly spawned child, handed to the bridge's I/O tasks
pub struct ChildPipes {
    /// Child stdin
    pub stdin: ChildStdin,
    /// Child stdout
    pub stdout: ChildStdout,
    /// Child stderr
    pub stderr: ChildStderr,
}

/// A spawned MCP server process.
///
/// The child itself is owned by a waiter task that reaps it and publishes
/// the exit on a watch channel; the handle keeps the pid, the exit watch and
/// a kill trigger. Dropping the handle kills the process.
pub struct ProcessHandle {
    server_id: String,
    pid: u32,
    started_at: DateTime<Utc>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ProcessHandle {
    /// Launch the process described by `config`
    #[tracing::instrument(skip(config), fields(server_id = %config.id, command = %config.command))]
    pub fn spawn(config: &ServerConfig) -> Result<(Self, ChildPipes)> {
        let mut command = Command::new(&config.command);
        command.args(&config.args);

        for (key, value) in resolve_env(&config.id, &config.env) {
            command.env(key, value);
        }

        if let Some(dir) = resolve_working_dir(config) {
            tracing::debug!(working_dir = %dir.display(), "Using working directory");
            command.current_dir(dir);
        }

        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| Error::Spawn(format!("Failed to start '{}': {}", config.command, e)))?;

        let pid = child.id();
        let pipes = ChildPipes {
            stdin: child
                .stdin
                .take()
                .ok_or_else(|| Error::Spawn("Failed to get stdin pipe from child process".to_string()))?,
            stdout: child
                .stdout
                .take()
                .ok_or_else(|| Error::Spawn("Failed to get stdout pipe from child process".to_string()))?,
            stderr: child
                .stderr
                .take()
                .ok_or_else(|| Error::Spawn("Failed to get stderr pipe from child process".to_string()))?,
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let server_id = config.id.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                // A dropped sender counts as a kill request too
                _ = kill_rx => {
                    if let Err(e) = child.kill() {
                        tracing::debug!(server_id = %server_id, error = %e, "Kill failed, process may be gone");
                    }
                    child.status().await
                }
                status = child.status() => status,
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(server_id = %server_id, error = %e, "Failed to reap server process");
                    None
                }
            };
            tracing::debug!(server_id = %server_id, pid, exit_code = ?code, "Server process exited");
            let _ = exit_tx.send(Some(ExitInfo {
                code,
                at: Utc::now(),
            }));
        });

        tracing::info!(pid, "Spawned server process");

        Ok((
            Self {
                server_id: config.id.clone(),
                pid,
                started_at: Utc::now(),
                exit_rx,
                kill_tx: Mutex::new(Some(kill_tx)),
            },
            pipes,
        ))
    }

    /// Server id this process belongs to
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// OS process id
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Spawn time
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Exit information, once the process has been reaped
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// Whether the process has exited
    pub fn has_exited(&self) -> bool {
        self.exit_info().is_some()
    }

    /// A receiver that observes the exit
    pub(crate) fn exit_watch(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_rx.clone()
    }

    /// Wait until the process has exited and been reaped
    pub async fn wait_exit(&self) -> ExitInfo {
        wait_for_exit(self.exit_rx.clone()).await
    }

    /// Stop the process: SIGTERM, wait up to `grace`, then kill. `force`
    /// kills immediately. Always waits for the reap and returns the exit code.
    #[tracing::instrument(skip(self), fields(server_id = %self.server_id, pid = self.pid))]
    pub async fn terminate(&self, grace: Duration, force: bool) -> Option<i32> {
        if let Some(info) = self.exit_info() {
            return info.code;
        }

        if !force && self.signal_terminate() {
            match tokio::time::timeout(grace, self.wait_exit()).await {
                Ok(info) => return info.code,
                Err(_) => {
                    tracing::warn!(grace = ?grace, "Server ignored SIGTERM, killing");
                }
            }
        }

        self.kill();
        self.wait_exit().await.code
    }

    #[cfg(unix)]
    fn signal_terminate(&self) -> bool {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        match kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "SIGTERM failed");
                false
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&self) -> bool {
        false
    }

    fn kill(&self) {
        if let Ok(mut kill_tx) = self.kill_tx.lock() {
            if let Some(tx) = kill_tx.take() {
                let _ = tx.send(());
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Resolve once the watched process has exited.
pub(crate) async fn wait_for_exit(mut rx: watch::Receiver<Option<ExitInfo>>) -> ExitInfo {
    loop {
        if let Some(info) = *rx.borrow_and_update() {
            return info;
        }
        if rx.changed().await.is_err() {
            // Waiter task vanished without publishing
            return rx.borrow().unwrap_or(ExitInfo {
                code: None,
                at: Utc::now(),
            });
        }
    }
}

/// Whether a configured value is an unfilled template rather than a value
pub fn is_placeholder(value: &str) -> bool {
    (value.contains('<') && value.contains('>')) || value.to_ascii_lowercase().contains("placeholder")
}

/// Configured variables to pass to the child.
///
/// Variables present in the gateway's own environment are left to
/// inheritance, so the inherited value wins. Placeholder values are dropped.
pub fn resolve_env(server_id: &str, configured: &BTreeMap<String, EnvVar>) -> Vec<(String, String)> {
    resolve_env_with(server_id, configured, |key| std::env::var_os(key).is_some())
}

fn resolve_env_with(
    server_id: &str,
    configured: &BTreeMap<String, EnvVar>,
    inherited: impl Fn(&str) -> bool,
) -> Vec<(String, String)> {
    let mut resolved = Vec::new();

    for (key, var) in configured {
        if inherited(key) {
            tracing::debug!(server_id, key = %key, "Using inherited value for environment variable");
            continue;
        }

        match &var.value {
            Some(value) if is_placeholder(value) => {
                tracing::warn!(
                    server_id,
                    key = %key,
                    required = var.required,
                    "Ignoring placeholder value for environment variable"
                );
            }
            Some(value) => resolved.push((key.clone(), value.clone())),
            None if var.required => {
                tracing::warn!(server_id, key = %key, "Required environment variable has no value");
            }
            None => {}
        }
    }

    resolved
}

/// Whether the command runs the latest published version of a package
/// through a package-manager runner (`npx pkg@latest`, `uvx pkg@latest`, ...)
pub fn is_run_latest(command: &str, args: &[String]) -> bool {
    let program = Path::new(command)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(command);

    let runner = match program {
        "npx" | "bunx" | "uvx" | "pnpx" => true,
        "pnpm" | "yarn" => args.first().is_some_and(|a| a == "dlx"),
        _ => false,
    };

    runner && args.iter().any(|a| a.ends_with("@latest"))
}

/// Working directory for the child: explicit config, then the install path,
/// then the install path's parent for run-latest invocations so the runner
/// does not pick up the installed package's own manifest.
pub fn resolve_working_dir(config: &ServerConfig) -> Option<PathBuf> {
    if let Some(dir) = &config.working_dir {
        return Some(dir.clone());
    }

    let install = config.install_path.as_ref()?;
    if is_run_latest(&config.command, &config.args) {
        if let Some(parent) = install.parent() {
            return Some(parent.to_path_buf());
        }
    }

    Some(install.clone())
}
