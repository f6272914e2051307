use super::lifecycle::ServerLifecycleEvent;
use super::state::{InstanceState, ServerState};
use crate::config::{ServerConfig, validate_server_config};
use crate::context::GatewayContext;
use crate::error::{Error, Result};
use crate::transport::ProtocolBridge;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The id has never been started
    NotFound,
    /// The server exists but had no live process
    AlreadyStopped,
    /// A live process was terminated and reaped
    Stopped {
        /// Exit code of the process, if it exited normally
        exit_code: Option<i32>,
    },
}

impl StopOutcome {
    /// Boolean form reported to clients: only `NotFound` is `false`
    pub fn as_bool(self) -> bool {
        !matches!(self, StopOutcome::NotFound)
    }
}

/// Point-in-time view of one supervised server
#[derive(Clone)]
pub struct ServerSnapshot {
    /// Configuration the server was started with
    pub config: ServerConfig,
    /// Instance state
    pub instance: InstanceState,
    /// Bridge to the live process, if any
    pub bridge: Option<Arc<ProtocolBridge>>,
}

struct ManagedServer {
    config: ServerConfig,
    instance: InstanceState,
    bridge: Option<Arc<ProtocolBridge>>,
}

impl ManagedServer {
    /// Fails unless the attached bridge is `observed` (`None`: nothing attached)
    fn ensure_attached(&self, observed: Option<&Arc<ProtocolBridge>>) -> Result<()> {
        let attached = match (&self.bridge, observed) {
            (Some(current), Some(observed)) => Arc::ptr_eq(current, observed),
            (None, None) => true,
            _ => false,
        };
        if attached {
            Ok(())
        } else {
            Err(Error::ProcessReplaced(self.instance.server_id.clone()))
        }
    }
}

fn poisoned() -> Error {
    Error::Other("Failed to lock server registry".to_string())
}

/// Owns every server process and drives the lifecycle state machine.
///
/// Mutating operations take a per-id async lock with `try_lock_owned`, so a
/// second start/stop/restart of the same id while one is in flight fails
/// fast with [`Error::OperationInProgress`]. Calls for different ids never
/// contend.
pub struct ProcessSupervisor {
    ctx: Arc<GatewayContext>,
    servers: Mutex<HashMap<String, ManagedServer>>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ProcessSupervisor {
    /// Create a supervisor with an empty registry
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        Self {
            ctx,
            servers: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Shared context
    pub fn context(&self) -> &Arc<GatewayContext> {
        &self.ctx
    }

    fn try_lock(&self, id: &str) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.locks.lock().map_err(|_| poisoned())?;
            Arc::clone(locks.entry(id.to_string()).or_default())
        };
        lock.try_lock_owned()
            .map_err(|_| Error::OperationInProgress(id.to_string()))
    }

    /// Reload persisted instance records from the store. Processes do not
    /// survive a gateway restart, so every restored record is marked stopped.
    #[tracing::instrument(skip(self))]
    pub async fn restore(&self) -> Result<usize> {
        let instances = self.ctx.store.load_instances().await?;
        let mut restored = 0;

        for mut instance in instances {
            let Some(config) = self.ctx.store.load_server(&instance.server_id).await? else {
                tracing::debug!(server_id = %instance.server_id, "Skipping instance without configuration");
                continue;
            };

            if instance.state != ServerState::Stopped {
                instance.state = ServerState::Stopped;
                instance.stop_time = Some(Utc::now());
            }
            instance.pid = None;

            let mut servers = self.servers.lock().map_err(|_| poisoned())?;
            servers.entry(config.id.clone()).or_insert(ManagedServer {
                config,
                instance,
                bridge: None,
            });
            restored += 1;
        }

        tracing::info!(restored, "Restored instance state");
        Ok(restored)
    }

    async fn resolve_config(&self, id: &str) -> Result<ServerConfig> {
        if let Some(config) = self.ctx.store.load_server(id).await? {
            return Ok(config);
        }
        let servers = self.servers.lock().map_err(|_| poisoned())?;
        servers
            .get(id)
            .map(|s| s.config.clone())
            .ok_or_else(|| Error::ServerNotFound(id.to_string()))
    }

    /// Whether `id` has instance state or a stored configuration
    pub async fn is_known(&self, id: &str) -> bool {
        let registered = self
            .servers
            .lock()
            .map(|servers| servers.contains_key(id))
            .unwrap_or(false);
        registered || matches!(self.ctx.store.load_server(id).await, Ok(Some(_)))
    }

    /// Apply `change` to the registry entry of `id`, then publish the result
    async fn apply(
        &self,
        id: &str,
        change: impl FnOnce(&mut ManagedServer) -> Result<()>,
    ) -> Result<InstanceState> {
        let snapshot = {
            let mut servers = self.servers.lock().map_err(|_| poisoned())?;
            let entry = servers
                .get_mut(id)
                .ok_or_else(|| Error::ServerNotFound(id.to_string()))?;
            change(entry)?;
            entry.instance.clone()
        };
        self.publish(&snapshot).await;
        Ok(snapshot)
    }

    async fn publish(&self, snapshot: &InstanceState) {
        self.ctx.metrics.set_status(&snapshot.server_id, snapshot.state);
        self.ctx.metrics.set_running(self.running_count());
        if let Err(e) = self.ctx.store.save_instance(snapshot).await {
            tracing::warn!(server_id = %snapshot.server_id, error = %e, "Failed to persist instance state");
        }
    }

    fn journal(&self, id: &str, event: ServerLifecycleEvent, details: Option<String>) {
        if let Err(e) = self.ctx.journal.record_event(id, event, details) {
            tracing::warn!(server_id = %id, error = %e, "Failed to record lifecycle event");
        }
    }

    /// Remove a bridge whose process is gone; returns a live one if present
    fn live_bridge(&self, id: &str) -> Result<Option<Arc<ProtocolBridge>>> {
        let mut servers = self.servers.lock().map_err(|_| poisoned())?;
        let Some(entry) = servers.get_mut(id) else {
            return Ok(None);
        };
        match &entry.bridge {
            Some(bridge) if bridge.is_alive() => Ok(Some(Arc::clone(bridge))),
            Some(_) => {
                entry.bridge = None;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Start a server. `config` overrides the stored configuration.
    ///
    /// Returns `Ok(false)` when the process could not be spawned or failed
    /// its handshake; the reason is kept in `last_error`.
    #[tracing::instrument(skip(self, config), fields(server_id = %id))]
    pub async fn start(&self, id: &str, config: Option<ServerConfig>) -> Result<bool> {
        let _guard = self.try_lock(id)?;
        self.start_locked(id, config, false).await
    }

    async fn start_locked(&self, id: &str, config: Option<ServerConfig>, automatic: bool) -> Result<bool> {
        if self.live_bridge(id)?.is_some() {
            return Err(Error::AlreadyRunning(id.to_string()));
        }

        let mut config = match config {
            Some(config) => config,
            None => self.resolve_config(id).await?,
        };
        if config.id.is_empty() {
            config.id = id.to_string();
        }
        validate_server_config(&config)?;

        {
            let mut servers = self.servers.lock().map_err(|_| poisoned())?;
            servers.entry(id.to_string()).or_insert_with(|| ManagedServer {
                config: config.clone(),
                instance: InstanceState::new(id),
                bridge: None,
            });
        }

        let snapshot_config = config.clone();
        self.apply(id, |server| {
            let state = server.instance.state;
            if state != ServerState::Stopped && state != ServerState::Restarting {
                server.instance.transition(ServerState::Stopped)?;
            }
            server.instance.transition(ServerState::Starting)?;
            server.instance.host = snapshot_config.host.clone();
            server.instance.port = snapshot_config.port;
            server.config = snapshot_config;
            Ok(())
        })
        .await?;

        tracing::info!(command = %config.command, "Starting server");

        let bridge = match ProtocolBridge::spawn(&config) {
            Ok(bridge) => bridge,
            Err(e) => return self.fail_start(id, automatic, e.to_string(), None).await,
        };

        let outcome = bridge.handshake(self.ctx.settings.handshake_timeout).await;
        if !outcome.is_ready() {
            let mut reason = outcome.reason();
            if let Some(line) = bridge.recent_stderr().last() {
                reason = format!("{}; last stderr: {}", reason, line);
            }
            let exit_code = bridge.shutdown(self.ctx.settings.stop_grace, true).await;
            return self.fail_start(id, automatic, reason, exit_code).await;
        }

        let pid = bridge.pid();
        let started_at = bridge.started_at();
        self.apply(id, move |server| {
            server.instance.transition(ServerState::Running)?;
            server.instance.pid = Some(pid);
            server.instance.start_time = Some(started_at);
            server.instance.stop_time = None;
            server.instance.exit_code = None;
            server.instance.last_error = None;
            server.bridge = Some(Arc::new(bridge));
            Ok(())
        })
        .await?;

        self.journal(id, ServerLifecycleEvent::Started, Some(format!("pid {}", pid)));
        tracing::info!(pid, "Server started successfully");
        Ok(true)
    }

    /// Record a failed start. Manual starts land in FAILED; automatic
    /// restarts land in CRASHED so the restart policy stays in charge.
    async fn fail_start(
        &self,
        id: &str,
        automatic: bool,
        reason: String,
        exit_code: Option<i32>,
    ) -> Result<bool> {
        let (target, event) = if automatic {
            (ServerState::Crashed, ServerLifecycleEvent::Crashed)
        } else {
            (ServerState::Failed, ServerLifecycleEvent::Failed)
        };

        tracing::error!(error = %reason, automatic, "Failed to start server");

        let details = reason.clone();
        self.apply(id, move |server| {
            server.instance.transition(target)?;
            server.instance.pid = None;
            server.instance.exit_code = exit_code;
            server.instance.stop_time = Some(Utc::now());
            server.instance.last_error = Some(reason);
            Ok(())
        })
        .await?;

        self.journal(id, event, Some(details));
        Ok(false)
    }

    /// Stop a server: SIGTERM, wait `stop_grace`, then kill. `force` skips
    /// the grace period.
    #[tracing::instrument(skip(self), fields(server_id = %id))]
    pub async fn stop(&self, id: &str, force: bool) -> Result<StopOutcome> {
        let _guard = self.try_lock(id)?;
        self.stop_locked(id, force).await
    }

    async fn stop_locked(&self, id: &str, force: bool) -> Result<StopOutcome> {
        let bridge = {
            let mut servers = self.servers.lock().map_err(|_| poisoned())?;
            match servers.get_mut(id) {
                None => {
                    tracing::warn!("Attempted to stop a server that was never started");
                    return Ok(StopOutcome::NotFound);
                }
                Some(server) => server.bridge.take(),
            }
        };

        let exit_code = match bridge {
            Some(bridge) => Some(bridge.shutdown(self.ctx.settings.stop_grace, force).await),
            None => None,
        };

        self.apply(id, |server| {
            if server.instance.state != ServerState::Stopped {
                server.instance.transition(ServerState::Stopped)?;
            }
            server.instance.pid = None;
            if let Some(code) = exit_code {
                server.instance.exit_code = code;
                server.instance.stop_time = Some(Utc::now());
            }
            Ok(())
        })
        .await?;

        match exit_code {
            Some(exit_code) => {
                self.journal(id, ServerLifecycleEvent::Stopped, None);
                tracing::info!(exit_code = ?exit_code, "Server stopped successfully");
                Ok(StopOutcome::Stopped { exit_code })
            }
            None => Ok(StopOutcome::AlreadyStopped),
        }
    }

    /// Manual restart. The per-id lock is held across stop and start, and
    /// restart history plus `restart_count` are reset.
    #[tracing::instrument(skip(self), fields(server_id = %id))]
    pub async fn restart(&self, id: &str) -> Result<bool> {
        let _guard = self.try_lock(id)?;
        let config = self.resolve_config(id).await?;

        if self.stop_locked(id, false).await? != StopOutcome::NotFound {
            self.apply(id, |server| {
                server.instance.restart_count = 0;
                Ok(())
            })
            .await?;
        }
        self.ctx.restarts.reset(id);
        self.journal(id, ServerLifecycleEvent::Restarted, Some("manual".to_string()));

        self.start_locked(id, Some(config), false).await
    }

    /// Automatic restart after a crash or failed health check: RESTARTING,
    /// stop, wait `delay`, start. Counts against the restart policy.
    ///
    /// `observed` is the bridge the caller judged broken. The call fails with
    /// [`Error::ProcessReplaced`] when another operation has since attached a
    /// different process, and with [`Error::InvalidTransition`] when the
    /// server is not in a state that may restart; neither touches the
    /// process.
    #[tracing::instrument(skip(self, observed), fields(server_id = %id))]
    pub async fn recover(
        &self,
        id: &str,
        delay: Duration,
        observed: Option<&Arc<ProtocolBridge>>,
    ) -> Result<bool> {
        let _guard = self.try_lock(id)?;
        let config = self.resolve_config(id).await?;

        let bridge = {
            let mut servers = self.servers.lock().map_err(|_| poisoned())?;
            let server = servers
                .get_mut(id)
                .ok_or_else(|| Error::ServerNotFound(id.to_string()))?;
            server.ensure_attached(observed)?;
            server.instance.check_transition(ServerState::Restarting)?;
            server.bridge.take()
        };
        let exit_code = match bridge {
            Some(bridge) => bridge.shutdown(self.ctx.settings.stop_grace, false).await,
            None => None,
        };

        let snapshot = self
            .apply(id, |server| {
                server.instance.transition(ServerState::Restarting)?;
                server.instance.restart_count += 1;
                server.instance.pid = None;
                if exit_code.is_some() {
                    server.instance.exit_code = exit_code;
                }
                Ok(())
            })
            .await?;

        self.ctx.restarts.record(id);
        self.ctx.metrics.inc_restarts(id);
        self.journal(
            id,
            ServerLifecycleEvent::Restarted,
            Some(format!("attempt {}", snapshot.restart_count)),
        );
        tracing::info!(attempt = snapshot.restart_count, delay = ?delay, "Restarting server");

        tokio::time::sleep(delay).await;
        self.start_locked(id, Some(config), true).await
    }

    /// Validated state change used by the health monitor and router.
    /// Marking CRASHED or FAILED also terminates any process still attached.
    ///
    /// `observed` is the bridge the verdict was reached on; if another
    /// process is attached by now the call fails with
    /// [`Error::ProcessReplaced`] and changes nothing.
    #[tracing::instrument(skip(self, observed), fields(server_id = %id))]
    pub async fn mark(
        &self,
        id: &str,
        state: ServerState,
        error: Option<String>,
        observed: Option<&Arc<ProtocolBridge>>,
    ) -> Result<InstanceState> {
        let _guard = self.try_lock(id)?;

        let detached = {
            let mut servers = self.servers.lock().map_err(|_| poisoned())?;
            let server = servers
                .get_mut(id)
                .ok_or_else(|| Error::ServerNotFound(id.to_string()))?;
            server.ensure_attached(observed)?;
            if server.instance.state != state {
                server.instance.check_transition(state)?;
            }
            if matches!(state, ServerState::Crashed | ServerState::Failed) {
                server.bridge.take()
            } else {
                None
            }
        };

        let exit_code = match detached {
            Some(bridge) => bridge.shutdown(self.ctx.settings.stop_grace, true).await,
            None => None,
        };

        let recorded_error = error.clone();
        let snapshot = self
            .apply(id, move |server| {
                if server.instance.state != state {
                    server.instance.transition(state)?;
                }
                if matches!(state, ServerState::Healthy | ServerState::Unhealthy) {
                    server.instance.last_health_check = Some(Utc::now());
                }
                if matches!(state, ServerState::Crashed | ServerState::Failed) {
                    server.instance.pid = None;
                    if exit_code.is_some() {
                        server.instance.exit_code = exit_code;
                    }
                }
                if state == ServerState::Healthy {
                    server.instance.last_error = None;
                } else if let Some(error) = recorded_error {
                    server.instance.last_error = Some(error);
                }
                Ok(())
            })
            .await?;

        let event = match state {
            ServerState::Crashed => Some(ServerLifecycleEvent::Crashed),
            ServerState::Failed => Some(ServerLifecycleEvent::Failed),
            ServerState::Unhealthy => Some(ServerLifecycleEvent::Unhealthy),
            _ => None,
        };
        if let Some(event) = event {
            self.journal(id, event, error);
        }

        Ok(snapshot)
    }

    /// Start every enabled server in the store. Failures are logged and
    /// reported per server; they never abort the others.
    #[tracing::instrument(skip(self))]
    pub async fn start_all(&self) -> Result<Vec<(String, bool)>> {
        tracing::info!("Starting all configured servers");
        let configs = self.ctx.store.load_servers().await?;

        let starts = configs
            .into_iter()
            .filter(|config| {
                if !config.enabled {
                    tracing::debug!(server_id = %config.id, "Skipping disabled server");
                }
                config.enabled
            })
            .map(|config| async move {
                let id = config.id.clone();
                let started = match self.start(&id, Some(config)).await {
                    Ok(started) => started,
                    Err(e) => {
                        tracing::error!(server_id = %id, error = %e, "Failed to start server");
                        false
                    }
                };
                (id, started)
            });

        let results = futures::future::join_all(starts).await;
        let started = results.iter().filter(|(_, ok)| *ok).count();
        tracing::info!(started, total = results.len(), "Finished starting all servers");
        Ok(results)
    }

    /// Stop every server with a live process
    #[tracing::instrument(skip(self))]
    pub async fn stop_all(&self) -> Vec<(String, bool)> {
        tracing::info!("Stopping all servers");
        let ids: Vec<String> = self
            .servers
            .lock()
            .map(|servers| {
                servers
                    .iter()
                    .filter(|(_, server)| server.bridge.is_some())
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default();

        let stops = ids.into_iter().map(|id| async move {
            let stopped = match self.stop(&id, false).await {
                Ok(outcome) => outcome.as_bool(),
                Err(e) => {
                    tracing::error!(server_id = %id, error = %e, "Failed to stop server");
                    false
                }
            };
            (id, stopped)
        });

        futures::future::join_all(stops).await
    }

    /// Instance state of one server
    pub fn status(&self, id: &str) -> Option<InstanceState> {
        self.servers
            .lock()
            .ok()
            .and_then(|servers| servers.get(id).map(|s| s.instance.clone()))
    }

    /// Instance state of every configured or previously started server,
    /// ordered by id. Configured servers that never ran report STOPPED.
    pub async fn statuses(&self) -> Result<Vec<InstanceState>> {
        let configs = self.ctx.store.load_servers().await?;
        let mut states: std::collections::BTreeMap<String, InstanceState> = configs
            .into_iter()
            .map(|config| (config.id.clone(), InstanceState::new(config.id)))
            .collect();

        let servers = self.servers.lock().map_err(|_| poisoned())?;
        for (id, server) in servers.iter() {
            states.insert(id.clone(), server.instance.clone());
        }

        Ok(states.into_values().collect())
    }

    /// Snapshots of every server with instance state
    pub fn snapshots(&self) -> Vec<ServerSnapshot> {
        self.servers
            .lock()
            .map(|servers| {
                servers
                    .values()
                    .map(|server| ServerSnapshot {
                        config: server.config.clone(),
                        instance: server.instance.clone(),
                        bridge: server.bridge.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of one server
    pub fn snapshot(&self, id: &str) -> Option<ServerSnapshot> {
        self.servers.lock().ok().and_then(|servers| {
            servers.get(id).map(|server| ServerSnapshot {
                config: server.config.clone(),
                instance: server.instance.clone(),
                bridge: server.bridge.clone(),
            })
        })
    }

    /// Bridge to the live process of `id`
    pub async fn bridge(&self, id: &str) -> Result<Arc<ProtocolBridge>> {
        if let Some(bridge) = self.live_bridge(id)? {
            return Ok(bridge);
        }
        if self.is_known(id).await {
            Err(Error::NotRunning(id.to_string()))
        } else {
            Err(Error::ServerNotFound(id.to_string()))
        }
    }

    /// Number of servers with a live process
    pub fn running_count(&self) -> usize {
        self.servers
            .lock()
            .map(|servers| {
                servers
                    .values()
                    .filter(|server| server.bridge.as_ref().is_some_and(|b| b.is_alive()))
                    .count()
            })
            .unwrap_or(0)
    }
}
