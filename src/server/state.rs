use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a supervised server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    /// No process, not scheduled
    Stopped,
    /// Process spawned, handshake in flight
    Starting,
    /// Handshake completed, not yet health checked
    Running,
    /// Last health check passed
    Healthy,
    /// Last protocol-level health check failed
    Unhealthy,
    /// The process exited or its pipes broke
    Crashed,
    /// An automatic or manual restart is in progress
    Restarting,
    /// Automation gave up; only a manual restart clears this
    Failed,
}

impl ServerState {
    /// Whether a transition from `self` to `next` is a documented edge
    pub fn can_transition_to(self, next: ServerState) -> bool {
        use ServerState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running | Failed | Crashed | Stopped)
                | (Running, Healthy | Unhealthy | Crashed | Stopped)
                | (Healthy, Healthy | Unhealthy | Crashed | Stopped)
                | (Unhealthy, Healthy | Unhealthy | Crashed | Restarting | Failed | Stopped)
                | (Crashed, Restarting | Failed | Stopped)
                | (Restarting, Starting | Failed | Stopped)
                | (Failed, Restarting | Stopped)
        )
    }

    /// States in which the server is expected to have a live process
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ServerState::Starting | ServerState::Running | ServerState::Healthy | ServerState::Unhealthy
        )
    }

    /// Numeric code exported as the status gauge
    pub fn metric_value(self) -> i64 {
        match self {
            ServerState::Stopped => 0,
            ServerState::Starting => 1,
            ServerState::Running => 2,
            ServerState::Healthy => 3,
            ServerState::Unhealthy => 4,
            ServerState::Crashed => 5,
            ServerState::Restarting => 6,
            ServerState::Failed => 7,
        }
    }

    /// Lowercase name, as serialized
    pub fn as_str(self) -> &'static str {
        match self {
            ServerState::Stopped => "stopped",
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::Healthy => "healthy",
            ServerState::Unhealthy => "unhealthy",
            ServerState::Crashed => "crashed",
            ServerState::Restarting => "restarting",
            ServerState::Failed => "failed",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted view of one server instance.
///
/// Created on first start, updated on every lifecycle change and marked
/// stopped (never deleted) on stop so it survives gateway restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    /// Server id
    pub server_id: String,
    /// Current lifecycle state
    pub state: ServerState,
    /// OS process id of the current or last process
    pub pid: Option<u32>,
    /// When the current or last process was started
    pub start_time: Option<DateTime<Utc>>,
    /// When the last process stopped
    pub stop_time: Option<DateTime<Utc>>,
    /// Exit code of the last process, if it exited normally
    pub exit_code: Option<i32>,
    /// Automatic restarts since the last explicit reset
    pub restart_count: u32,
    /// Time of the last completed health check
    pub last_health_check: Option<DateTime<Utc>>,
    /// Most recent failure description
    pub last_error: Option<String>,
    /// Host the server listens on, if any
    pub host: Option<String>,
    /// Port the server listens on, if any
    pub port: Option<u16>,
}

impl InstanceState {
    /// Fresh state for a server that has never run
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            state: ServerState::Stopped,
            pid: None,
            start_time: None,
            stop_time: None,
            exit_code: None,
            restart_count: 0,
            last_health_check: None,
            last_error: None,
            host: None,
            port: None,
        }
    }

    /// Fail with [`Error::InvalidTransition`] unless `next` is a documented edge
    pub fn check_transition(&self, next: ServerState) -> Result<()> {
        if self.state.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                id: self.server_id.clone(),
                from: self.state.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// Move to `next`, rejecting undocumented edges
    pub fn transition(&mut self, next: ServerState) -> Result<()> {
        self.check_transition(next)?;
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documented_path_is_allowed() {
        let mut state = InstanceState::new("a");
        for next in [
            ServerState::Starting,
            ServerState::Running,
            ServerState::Healthy,
            ServerState::Unhealthy,
            ServerState::Crashed,
            ServerState::Restarting,
            ServerState::Starting,
            ServerState::Failed,
        ] {
            state.transition(next).unwrap();
        }
        assert_eq!(state.state, ServerState::Failed);
    }

    #[test]
    fn test_failed_does_not_auto_exit() {
        let mut state = InstanceState::new("a");
        state.state = ServerState::Failed;

        assert!(state.transition(ServerState::Starting).is_err());
        assert!(state.transition(ServerState::Healthy).is_err());
        assert_eq!(state.state, ServerState::Failed);

        state.transition(ServerState::Restarting).unwrap();
    }

    #[test]
    fn test_stopped_only_goes_to_starting() {
        for next in [
            ServerState::Running,
            ServerState::Healthy,
            ServerState::Crashed,
            ServerState::Failed,
        ] {
            assert!(!ServerState::Stopped.can_transition_to(next));
        }
    }

    #[test]
    fn test_serialized_names() {
        let json = serde_json::to_string(&ServerState::Unhealthy).unwrap();
        assert_eq!(json, "\"unhealthy\"");
    }
}
