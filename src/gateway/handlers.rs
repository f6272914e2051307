//! HTTP request handlers for the gateway.
//!
//! - `/{id}/mcp` and friends proxy JSON-RPC to one server
//! - `/{id}/sse` streams the server's output as Server-Sent Events
//! - `/health`, `/servers`, `/metrics` report on the gateway itself

use crate::error::Error;
use crate::gateway::actix_error::ApiError;
use crate::gateway::router::GatewayRouter;
use crate::gateway::types::{
    EventsQuery, GatewayHealth, LifecycleResponse, SSEMessage, StopQuery, ToolCallRequest,
};
use crate::server::InstanceState;
use crate::transport::{JsonRpcResponse, error_codes};
use actix_web::{
    HttpResponse, ResponseError,
    http::StatusCode,
    web::{Data, Json, Path, Query},
};
use serde_json::{Value, json};

type HandlerResult = std::result::Result<HttpResponse, ApiError>;

/// Error reply for the JSON-RPC endpoint: a JSON-RPC error object carrying
/// the request id, sent with the mapped HTTP status
fn jsonrpc_failure(request_id: Value, error: &Error) -> HttpResponse {
    let code = match error {
        Error::JsonRpc { code, .. } => *code,
        Error::Protocol(_) => error_codes::INTERNAL_ERROR,
        _ => error_codes::SERVER_UNAVAILABLE,
    };
    let body = JsonRpcResponse::error(request_id, code, error.to_string(), None);

    HttpResponse::build(error.status_code()).json(body)
}

fn lifecycle_response(router: &GatewayRouter, id: &str, success: bool) -> HttpResponse {
    let instance = router.supervisor().status(id);
    HttpResponse::Ok().json(LifecycleResponse {
        server_id: id.to_string(),
        success,
        state: instance.as_ref().map(|i| i.state),
        error: instance.and_then(|i| i.last_error),
    })
}

async fn ensure_known(router: &GatewayRouter, id: &str) -> Result<(), ApiError> {
    if router.supervisor().is_known(id).await {
        Ok(())
    } else {
        Err(Error::ServerNotFound(id.to_string()).into())
    }
}

/// `POST /{id}/mcp`
pub async fn mcp_proxy(router: Data<GatewayRouter>, path: Path<String>, body: Json<Value>) -> HandlerResult {
    let id = path.into_inner();
    let payload = body.into_inner();

    if !payload.is_object() {
        return Err(ApiError::InvalidRequest(
            "JSON-RPC payload must be an object".to_string(),
        ));
    }

    let request_id = payload.get("id").cloned().unwrap_or(Value::Null);
    tracing::debug!(server_id = %id, method = ?payload.get("method"), "Proxying JSON-RPC message");

    match router.forward(&id, payload).await {
        Ok(Some(response)) => Ok(HttpResponse::Ok().json(response)),
        Ok(None) => Ok(HttpResponse::Accepted().json(json!({ "status": "accepted" }))),
        Err(e) => {
            tracing::warn!(server_id = %id, error = %e, "Proxy request failed");
            Ok(jsonrpc_failure(request_id, &e))
        }
    }
}

/// `GET /{id}/mcp/tools/list`
pub async fn tools_list(router: Data<GatewayRouter>, path: Path<String>) -> HandlerResult {
    let id = path.into_inner();
    let response = router.list_tools(&id).await?;
    Ok(HttpResponse::Ok().json(response))
}

/// `POST /{id}/mcp/tools/call`
pub async fn tools_call(
    router: Data<GatewayRouter>,
    path: Path<String>,
    body: Json<ToolCallRequest>,
) -> HandlerResult {
    let id = path.into_inner();
    let ToolCallRequest { name, arguments } = body.into_inner();

    if name.is_empty() {
        return Err(ApiError::InvalidRequest("tool name is empty".to_string()));
    }

    let response = router.call_tool(&id, &name, arguments).await?;
    Ok(HttpResponse::Ok().json(response))
}

/// `POST /{id}/sse`
pub async fn sse_stream(router: Data<GatewayRouter>, path: Path<String>, body: Json<Value>) -> HandlerResult {
    let id = path.into_inner();
    let payload = body.into_inner();

    if !payload.is_object() {
        return Err(ApiError::InvalidRequest(
            "JSON-RPC payload must be an object".to_string(),
        ));
    }

    let mut events = router.stream(&id, payload).await?;
    tracing::debug!(server_id = %id, "SSE stream opened");

    let stream = async_stream::stream! {
        while let Some(event) = events.recv().await {
            let message = SSEMessage::from(event);
            yield Ok::<_, actix_web::Error>(message.format());
        }
    };

    Ok(HttpResponse::Ok()
        .append_header(("Content-Type", "text/event-stream"))
        .append_header(("Cache-Control", "no-cache"))
        .append_header(("Connection", "keep-alive"))
        .streaming(stream))
}

/// `GET /{id}/health`
pub async fn server_health(router: Data<GatewayRouter>, path: Path<String>) -> HandlerResult {
    let id = path.into_inner();

    if let Some(instance) = router.supervisor().status(&id) {
        return Ok(HttpResponse::Ok().json(instance));
    }

    ensure_known(&router, &id).await?;
    Ok(HttpResponse::Ok().json(InstanceState::new(id)))
}

/// `GET /health`
pub async fn gateway_health(router: Data<GatewayRouter>) -> HandlerResult {
    let statuses = router.supervisor().statuses().await?;
    let running = router.supervisor().running_count();

    let (status, code) = if running == 0 {
        ("degraded", StatusCode::SERVICE_UNAVAILABLE)
    } else {
        ("ok", StatusCode::OK)
    };

    Ok(HttpResponse::build(code).json(GatewayHealth {
        status,
        servers_running: running,
        servers_total: statuses.len(),
    }))
}

/// `GET /servers`
pub async fn list_servers(router: Data<GatewayRouter>) -> HandlerResult {
    let statuses = router.supervisor().statuses().await?;
    Ok(HttpResponse::Ok().json(json!({ "servers": statuses })))
}

/// `POST /servers/{id}/start`
pub async fn start_server(router: Data<GatewayRouter>, path: Path<String>) -> HandlerResult {
    let id = path.into_inner();
    let started = router.supervisor().start(&id, None).await?;
    Ok(lifecycle_response(&router, &id, started))
}

/// `POST /servers/{id}/stop`
pub async fn stop_server(
    router: Data<GatewayRouter>,
    path: Path<String>,
    query: Query<StopQuery>,
) -> HandlerResult {
    let id = path.into_inner();
    ensure_known(&router, &id).await?;

    let outcome = router.supervisor().stop(&id, query.force).await?;
    tracing::info!(server_id = %id, outcome = ?outcome, "Stop requested over HTTP");
    Ok(lifecycle_response(&router, &id, outcome.as_bool()))
}

/// `POST /servers/{id}/restart`
pub async fn restart_server(router: Data<GatewayRouter>, path: Path<String>) -> HandlerResult {
    let id = path.into_inner();
    let started = router.supervisor().restart(&id).await?;
    Ok(lifecycle_response(&router, &id, started))
}

/// `GET /servers/{id}/events`
pub async fn server_events(
    router: Data<GatewayRouter>,
    path: Path<String>,
    query: Query<EventsQuery>,
) -> HandlerResult {
    let id = path.into_inner();
    ensure_known(&router, &id).await?;

    let events = router
        .supervisor()
        .context()
        .journal
        .get_server_events(&id, query.limit)?;
    Ok(HttpResponse::Ok().json(json!({ "server_id": id, "events": events })))
}

/// `GET /metrics`
pub async fn metrics(router: Data<GatewayRouter>) -> HandlerResult {
    let body = router.supervisor().context().metrics.render()?;
    Ok(HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(body))
}
