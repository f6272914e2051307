use super::restart::compute_delay;
use super::state::ServerState;
use super::supervisor::{ProcessSupervisor, ServerSnapshot};
use crate::config::{GatewaySettings, HealthCheck, ServerConfig};
use crate::error::{Error, Result};
use crate::transport::ProtocolBridge;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::Instrument;

/// Server health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerHealth {
    /// Process alive and the protocol probe passed
    Healthy,
    /// Process alive but the protocol probe failed
    Unhealthy,
    /// Process gone or its pipes broken
    Crashed,
    /// Server health is unknown
    Unknown,
}

impl ServerHealth {
    fn as_label(self) -> &'static str {
        match self {
            ServerHealth::Healthy => "healthy",
            ServerHealth::Unhealthy => "unhealthy",
            ServerHealth::Crashed => "crashed",
            ServerHealth::Unknown => "unknown",
        }
    }
}

/// Result of the most recent check of one server
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Verdict
    pub health: ServerHealth,
    /// When the check ran
    pub checked_at: DateTime<Utc>,
    /// Failure reason
    pub detail: Option<String>,
}

/// Server monitor configuration
#[derive(Debug, Clone)]
pub struct ServerMonitorConfig {
    /// Check interval
    pub check_interval: Duration,
    /// Health check timeout
    pub health_check_timeout: Duration,
    /// Restart history older than this is pruned each tick
    pub history_retention: Duration,
}

impl ServerMonitorConfig {
    /// Monitor settings from the gateway section
    pub fn from_settings(settings: &GatewaySettings) -> Self {
        Self {
            check_interval: settings.health_check_interval,
            health_check_timeout: settings.health_check_timeout,
            history_retention: settings.history_retention,
        }
    }
}

impl Default for ServerMonitorConfig {
    fn default() -> Self {
        Self::from_settings(&GatewaySettings::default())
    }
}

struct MonitorInner {
    supervisor: Arc<ProcessSupervisor>,
    config: ServerMonitorConfig,
    reports: Mutex<HashMap<String, HealthReport>>,
    http: reqwest::Client,
}

/// Periodic health checks with policy-driven automatic restarts
pub struct ServerMonitor {
    inner: Arc<MonitorInner>,
    monitor_task: Option<JoinHandle<()>>,
    running: Arc<Mutex<bool>>,
}

impl ServerMonitor {
    /// Create a new server monitor
    pub fn new(supervisor: Arc<ProcessSupervisor>, config: ServerMonitorConfig) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                supervisor,
                config,
                reports: Mutex::new(HashMap::new()),
                http: reqwest::Client::new(),
            }),
            monitor_task: None,
            running: Arc::new(Mutex::new(false)),
        }
    }

    /// Start the monitor loop. The first pass runs one interval from now.
    pub fn start(&mut self) -> Result<()> {
        {
            let mut running = self
                .running
                .lock()
                .map_err(|_| Error::Other("Failed to lock running flag".to_string()))?;

            if *running {
                return Ok(());
            }

            *running = true;
        }

        let inner = Arc::clone(&self.inner);
        let running = Arc::clone(&self.running);

        let task = tokio::spawn(async move {
            let mut interval = time::interval(inner.config.check_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                interval.tick().await;

                if !running.lock().map(|flag| *flag).unwrap_or(false) {
                    break;
                }

                // Restarts keep running in the background; the next pass
                // skips servers that are mid-restart
                let (results, recoveries) = inner.check_all().await;
                tracing::debug!(
                    checked = results.len(),
                    restarting = recoveries.len(),
                    "Health check pass complete"
                );
            }
        });

        tracing::info!(interval = ?self.inner.config.check_interval, "Health monitor started");
        self.monitor_task = Some(task);

        Ok(())
    }

    /// Stop the monitor
    pub fn stop(&mut self) -> Result<()> {
        {
            let mut running = self
                .running
                .lock()
                .map_err(|_| Error::Other("Failed to lock running flag".to_string()))?;

            if !*running {
                return Ok(());
            }

            *running = false;
        }

        if let Some(task) = self.monitor_task.take() {
            task.abort();
        }

        tracing::info!("Health monitor stopped");
        Ok(())
    }

    /// Whether the monitor loop is active
    pub fn is_running(&self) -> bool {
        self.running.lock().map(|flag| *flag).unwrap_or(false)
    }

    /// Run one check pass over every supervised server now and wait for
    /// the restarts it triggers
    pub async fn check_all(&self) -> Vec<(String, ServerHealth)> {
        let (results, recoveries) = self.inner.check_all().await;
        futures::future::join_all(recoveries).await;
        results
    }

    /// Last report for a server
    pub fn get_health(&self, id: &str) -> Option<HealthReport> {
        self.inner
            .reports
            .lock()
            .ok()
            .and_then(|reports| reports.get(id).cloned())
    }
}

impl Drop for ServerMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.monitor_task.take() {
            task.abort();
        }
    }
}

type Recovery = JoinHandle<()>;

impl MonitorInner {
    async fn check_all(&self) -> (Vec<(String, ServerHealth)>, Vec<Recovery>) {
        let ctx = self.supervisor.context();
        ctx.restarts.prune(self.config.history_retention);

        let checks = self
            .supervisor
            .snapshots()
            .into_iter()
            .map(|snapshot| self.check_server(snapshot));

        let mut results = Vec::new();
        let mut recoveries = Vec::new();
        for (id, health, recovery) in futures::future::join_all(checks).await.into_iter().flatten() {
            results.push((id, health));
            recoveries.extend(recovery);
        }
        (results, recoveries)
    }

    #[tracing::instrument(skip(self, snapshot), fields(server_id = %snapshot.instance.server_id))]
    async fn check_server(
        &self,
        snapshot: ServerSnapshot,
    ) -> Option<(String, ServerHealth, Option<Recovery>)> {
        let id = snapshot.instance.server_id.clone();

        // Stopped and failed servers are left alone; starting and restarting
        // ones are mid-operation
        if matches!(
            snapshot.instance.state,
            ServerState::Stopped | ServerState::Failed | ServerState::Starting | ServerState::Restarting
        ) {
            return None;
        }

        let (health, detail) = match &snapshot.bridge {
            None => (ServerHealth::Crashed, Some("no process attached".to_string())),
            Some(bridge) if !bridge.is_alive() => (
                ServerHealth::Crashed,
                Some(match bridge.exit_code() {
                    Some(code) => format!("process exited with code {}", code),
                    None => "process exited".to_string(),
                }),
            ),
            Some(bridge) if bridge.is_transport_lost() => {
                (ServerHealth::Crashed, Some("transport lost".to_string()))
            }
            Some(bridge) => match self.probe(&snapshot.config, bridge).await {
                Ok(()) => (ServerHealth::Healthy, None),
                Err(e) => (ServerHealth::Unhealthy, Some(e.to_string())),
            },
        };

        let state = match health {
            ServerHealth::Healthy => ServerState::Healthy,
            ServerHealth::Unhealthy => ServerState::Unhealthy,
            _ => ServerState::Crashed,
        };

        // The verdict only holds for the process it was reached on
        match self
            .supervisor
            .mark(&id, state, detail.clone(), snapshot.bridge.as_ref())
            .await
        {
            Ok(_) => {}
            Err(Error::OperationInProgress(_)) => {
                tracing::debug!("Lifecycle operation in progress, skipping");
                return None;
            }
            Err(Error::ProcessReplaced(_)) => {
                tracing::debug!("Process replaced since the snapshot, skipping");
                return None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to record health state");
                return Some((id, health, None));
            }
        }

        self.supervisor
            .context()
            .metrics
            .observe_health(&id, health.as_label());
        self.record(&id, health, detail.clone());

        if health == ServerHealth::Healthy {
            return Some((id, health, None));
        }

        tracing::warn!(health = ?health, reason = ?detail, "Server is not healthy");
        // Marking CRASHED detaches the process; an UNHEALTHY one stays attached
        let attached = match health {
            ServerHealth::Unhealthy => snapshot.bridge,
            _ => None,
        };
        let recovery = self
            .handle_failure(&snapshot.config, detail.unwrap_or_default(), attached)
            .await;

        Some((id, health, recovery))
    }

    /// Apply the restart policy. An allowed restart is spawned so its
    /// backoff never holds up the check pass.
    async fn handle_failure(
        &self,
        config: &ServerConfig,
        reason: String,
        attached: Option<Arc<ProtocolBridge>>,
    ) -> Option<Recovery> {
        let id = config.id.as_str();
        let policy = &config.restart_policy;

        if !policy.auto_restart {
            let error = format!("automatic restart disabled: {}", reason);
            if let Err(e) = self
                .supervisor
                .mark(id, ServerState::Failed, Some(error), attached.as_ref())
                .await
            {
                tracing::warn!(error = %e, "Failed to mark server failed");
            }
            return None;
        }

        let restart_count = self
            .supervisor
            .status(id)
            .map_or(0, |instance| instance.restart_count);
        let decision = self
            .supervisor
            .context()
            .restarts
            .can_restart(id, policy, restart_count);

        if !decision.is_allowed() {
            let error = format!("{} ({})", Error::RestartExhausted(id.to_string()), decision.reason());
            tracing::error!(error = %error, "Giving up on server");
            if let Err(e) = self
                .supervisor
                .mark(id, ServerState::Failed, Some(error), attached.as_ref())
                .await
            {
                tracing::warn!(error = %e, "Failed to mark server failed");
            }
            return None;
        }

        let delay = compute_delay(policy, restart_count);
        let supervisor = Arc::clone(&self.supervisor);
        let id = id.to_string();
        let recovery = async move {
            match supervisor.recover(&id, delay, attached.as_ref()).await {
                Ok(true) => tracing::info!("Server recovered"),
                Ok(false) => tracing::warn!("Restart attempt failed"),
                Err(e) => tracing::warn!(error = %e, "Restart attempt aborted"),
            }
        };
        Some(tokio::spawn(recovery.in_current_span()))
    }

    async fn probe(&self, config: &ServerConfig, bridge: &ProtocolBridge) -> Result<()> {
        let timeout = self.config.health_check_timeout;

        match &config.health_check {
            HealthCheck::None => Ok(()),
            HealthCheck::ToolsList => time::timeout(timeout, bridge.call("tools/list", None))
                .await
                .map_err(|_| Error::Timeout(format!("tools/list probe exceeded {:?}", timeout)))?
                .map(|_| ()),
            HealthCheck::Http { path } => {
                let host = config.host.as_deref().unwrap_or("127.0.0.1");
                let port = config.port.ok_or_else(|| {
                    Error::ConfigInvalid("http health check requires a port".to_string())
                })?;
                let separator = if path.starts_with('/') { "" } else { "/" };
                let url = format!("http://{}:{}{}{}", host, port, separator, path);

                let response = self
                    .http
                    .get(&url)
                    .timeout(timeout)
                    .send()
                    .await
                    .map_err(|e| Error::Other(format!("health probe {} failed: {}", url, e)))?;

                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(Error::Other(format!(
                        "health probe {} returned {}",
                        url,
                        response.status()
                    )))
                }
            }
        }
    }

    fn record(&self, id: &str, health: ServerHealth, detail: Option<String>) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.insert(
                id.to_string(),
                HealthReport {
                    health,
                    checked_at: Utc::now(),
                    detail,
                },
            );
        }
    }
}
