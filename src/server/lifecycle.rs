use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Maximum number of events retained across all servers
const MAX_EVENTS: usize = 1000;

/// Server lifecycle event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerLifecycleEvent {
    /// Server started and completed its handshake
    Started,
    /// Server was stopped on request
    Stopped,
    /// Server failed to start, or automation gave up on it
    Failed,
    /// Server process died or lost its pipes
    Crashed,
    /// A protocol-level health check failed
    Unhealthy,
    /// Server was restarted
    Restarted,
}

/// Server lifecycle event
#[derive(Debug, Clone, Serialize)]
pub struct ServerEvent {
    /// Server id
    pub server_id: String,
    /// Event type
    pub event: ServerLifecycleEvent,
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
    /// Event details
    pub details: Option<String>,
}

/// Bounded journal of lifecycle events, newest last
#[derive(Default)]
pub struct LifecycleJournal {
    events: Mutex<VecDeque<ServerEvent>>,
}

impl LifecycleJournal {
    /// Create an empty journal
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a server event
    pub fn record_event(
        &self,
        server_id: &str,
        event: ServerLifecycleEvent,
        details: Option<String>,
    ) -> Result<()> {
        let mut events = self
            .events
            .lock()
            .map_err(|_| Error::Other("Failed to lock server events".to_string()))?;

        events.push_back(ServerEvent {
            server_id: server_id.to_string(),
            event,
            timestamp: Utc::now(),
            details,
        });

        while events.len() > MAX_EVENTS {
            events.pop_front();
        }

        Ok(())
    }

    /// Recent events for a server, newest first
    pub fn get_server_events(&self, server_id: &str, limit: Option<usize>) -> Result<Vec<ServerEvent>> {
        let events = self
            .events
            .lock()
            .map_err(|_| Error::Other("Failed to lock server events".to_string()))?;

        Ok(events
            .iter()
            .rev()
            .filter(|e| e.server_id == server_id)
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }
}
