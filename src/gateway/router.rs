use crate::context::GatewayContext;
use crate::error::{Error, Result};
use crate::server::{ProcessSupervisor, ServerState, compute_delay};
use crate::transport::{JsonRpcRequest, ProtocolBridge, StreamEvent};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Routes client JSON-RPC traffic to the bridge of the addressed server.
///
/// A call that fails because the server's pipes broke gets one retry after
/// an opportunistic restart, when the restart policy still allows one and
/// `retry_on_transport_error` is set.
#[derive(Clone)]
pub struct GatewayRouter {
    supervisor: Arc<ProcessSupervisor>,
}

fn is_notification_payload(payload: &Value) -> bool {
    payload.get("id").is_none_or(Value::is_null)
}

impl GatewayRouter {
    /// Create a router over `supervisor`
    pub fn new(supervisor: Arc<ProcessSupervisor>) -> Self {
        Self { supervisor }
    }

    /// Underlying supervisor
    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    fn ctx(&self) -> &Arc<GatewayContext> {
        self.supervisor.context()
    }

    /// Forward one JSON-RPC message. Returns `None` for notifications.
    #[tracing::instrument(skip(self, payload), fields(server_id = %id))]
    pub async fn forward(&self, id: &str, payload: Value) -> Result<Option<Value>> {
        let bridge = self.supervisor.bridge(id).await?;
        let method = payload
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let started = Instant::now();

        let result = match self.send(id, &bridge, &payload).await {
            Err(e) if self.recover_for_retry(id, &bridge, &e).await => {
                tracing::info!(method = %method, "Retrying after restart");
                match self.supervisor.bridge(id).await {
                    Ok(bridge) => self.send(id, &bridge, &payload).await,
                    Err(e) => Err(e),
                }
            }
            other => other,
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(Error::Timeout(_)) => "timeout",
            Err(_) => "error",
        };
        self.ctx()
            .metrics
            .observe_request(id, &method, outcome, started.elapsed());

        result
    }

    async fn send(&self, id: &str, bridge: &ProtocolBridge, payload: &Value) -> Result<Option<Value>> {
        if is_notification_payload(payload) {
            bridge.notify(payload.clone()).await?;
            return Ok(None);
        }

        let request = bridge.request(payload.clone());
        match self.ctx().settings.request_timeout {
            Some(timeout) => tokio::time::timeout(timeout, request)
                .await
                .map_err(|_| {
                    Error::Timeout(format!("no response from '{}' within {:?}", id, timeout))
                })?
                .map(Some),
            None => request.await.map(Some),
        }
    }

    /// `tools/list` on server `id`
    pub async fn list_tools(&self, id: &str) -> Result<Value> {
        let request = JsonRpcRequest::list_tools(Uuid::new_v4().to_string());
        self.forward(id, serde_json::to_value(&request)?)
            .await?
            .ok_or_else(|| Error::Protocol("no response to tools/list".to_string()))
    }

    /// `tools/call` on server `id`
    pub async fn call_tool(&self, id: &str, name: &str, arguments: Value) -> Result<Value> {
        let request = JsonRpcRequest::call_tool(Uuid::new_v4().to_string(), name, arguments);
        self.forward(id, serde_json::to_value(&request)?)
            .await?
            .ok_or_else(|| Error::Protocol("no response to tools/call".to_string()))
    }

    /// Forward a request and stream every line the server produces for it
    #[tracing::instrument(skip(self, payload), fields(server_id = %id))]
    pub async fn stream(&self, id: &str, payload: Value) -> Result<mpsc::Receiver<StreamEvent>> {
        let mut payload = payload;
        if is_notification_payload(&payload) {
            if let Some(object) = payload.as_object_mut() {
                object.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
            }
        }

        let bridge = self.supervisor.bridge(id).await?;
        match bridge.stream(payload.clone()).await {
            Err(e) if self.recover_for_retry(id, &bridge, &e).await => {
                self.supervisor.bridge(id).await?.stream(payload).await
            }
            other => other,
        }
    }

    /// Restart `id` once after a transport failure on `bridge`, when
    /// allowed. Also `true` when another operation already replaced the
    /// process, so the retry goes to the new one.
    async fn recover_for_retry(&self, id: &str, bridge: &Arc<ProtocolBridge>, error: &Error) -> bool {
        if !error.is_transport() || !self.ctx().settings.retry_on_transport_error {
            return false;
        }

        let Some(snapshot) = self.supervisor.snapshot(id) else {
            return false;
        };
        let policy = &snapshot.config.restart_policy;
        if !policy.auto_restart {
            return false;
        }

        let restart_count = snapshot.instance.restart_count;
        let decision = self.ctx().restarts.can_restart(id, policy, restart_count);
        if !decision.is_allowed() {
            tracing::debug!(reason = decision.reason(), "Not retrying");
            return false;
        }

        match self
            .supervisor
            .mark(id, ServerState::Crashed, Some(error.to_string()), Some(bridge))
            .await
        {
            Ok(_) => {}
            Err(Error::ProcessReplaced(_)) => {
                tracing::debug!("Process already replaced, retrying on the current one");
                return true;
            }
            Err(e) => {
                tracing::debug!(error = %e, "Could not mark server crashed, not retrying");
                return false;
            }
        }

        // Marking CRASHED detached the process
        match self
            .supervisor
            .recover(id, compute_delay(policy, restart_count), None)
            .await
        {
            Ok(recovered) => recovered,
            Err(e) => {
                tracing::warn!(error = %e, "Restart before retry failed");
                false
            }
        }
    }
}
