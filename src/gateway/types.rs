//! Request and response bodies of the HTTP gateway.

use crate::server::ServerState;
use crate::transport::StreamEvent;
use actix_web::web::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Server-Sent Event message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SSEMessage {
    /// Event type
    pub event: String,
    /// Event payload, one line
    pub data: String,
    /// Optional event ID
    pub id: Option<String>,
}

impl SSEMessage {
    /// Creates a new SSE message with the given event type, data payload, and optional ID
    pub fn new(event: &str, data: &str, id: Option<&str>) -> Self {
        Self {
            event: event.to_string(),
            data: data.to_string(),
            id: id.map(String::from),
        }
    }

    /// Format the message for the wire
    pub fn format(&self) -> Bytes {
        let mut result = String::new();

        if let Some(id) = &self.id {
            result.push_str(&format!("id: {}\n", id));
        }

        result.push_str(&format!("event: {}\n", self.event));
        result.push_str(&format!("data: {}\n\n", self.data));

        Bytes::from(result)
    }
}

impl From<StreamEvent> for SSEMessage {
    fn from(event: StreamEvent) -> Self {
        match event {
            StreamEvent::Message(message) => {
                let id = message.get("id").filter(|id| !id.is_null()).map(|id| match id {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
                SSEMessage::new("message", &message.to_string(), id.as_deref())
            }
            StreamEvent::Raw(line) => SSEMessage::new("raw", &line, None),
            StreamEvent::Failed(error) => {
                SSEMessage::new("error", &json!({ "error": error }).to_string(), None)
            }
        }
    }
}

/// Body of `POST /{id}/mcp/tools/call`
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallRequest {
    /// Tool name
    pub name: String,
    /// Tool arguments
    #[serde(default)]
    pub arguments: Value,
}

/// Query of `POST /servers/{id}/stop`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StopQuery {
    /// Skip the grace period
    #[serde(default)]
    pub force: bool,
}

/// Query of `GET /servers/{id}/events`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventsQuery {
    /// Maximum number of events
    pub limit: Option<usize>,
}

/// Result of a lifecycle operation
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleResponse {
    /// Server id
    pub server_id: String,
    /// Whether the operation succeeded
    pub success: bool,
    /// State after the operation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<ServerState>,
    /// Last recorded error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize)]
pub struct GatewayHealth {
    /// `ok` or `degraded`
    pub status: &'static str,
    /// Servers with a live process
    pub servers_running: usize,
    /// Configured or previously started servers
    pub servers_total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_sse_message() {
        let message = SSEMessage::new("message", "{\"a\":1}", Some("7"));
        assert_eq!(
            message.format(),
            Bytes::from("id: 7\nevent: message\ndata: {\"a\":1}\n\n")
        );
    }

    #[test]
    fn test_stream_events_map_to_sse_types() {
        let raw: SSEMessage = StreamEvent::Raw("loading...".to_string()).into();
        assert_eq!(raw.event, "raw");
        assert_eq!(raw.data, "loading...");

        let message: SSEMessage = StreamEvent::Message(json!({"id": "a", "result": {}})).into();
        assert_eq!(message.event, "message");
        assert_eq!(message.id.as_deref(), Some("a"));

        let failed: SSEMessage = StreamEvent::Failed("transport lost".to_string()).into();
        assert_eq!(failed.event, "error");
        assert!(failed.data.contains("transport lost"));
    }
}
