mod common;

use common::{mock_server_script, raw_echo_script, script_config, write_script};
use mcp_gateway::error::{Error, Result};
use mcp_gateway::transport::{HandshakeOutcome, ProtocolBridge, StreamEvent};
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;

async fn ready_bridge(dir: &TempDir) -> Result<ProtocolBridge> {
    let script = write_script(dir.path(), "server.sh", &mock_server_script());
    let bridge = ProtocolBridge::spawn(&script_config("mock", &script))?;
    let outcome = bridge.handshake(Duration::from_secs(5)).await;
    assert!(outcome.is_ready(), "handshake failed: {}", outcome.reason());
    Ok(bridge)
}

#[tokio::test]
async fn test_handshake_returns_server_info() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "server.sh", &mock_server_script());
    let bridge = ProtocolBridge::spawn(&script_config("mock", &script))?;

    match bridge.handshake(Duration::from_secs(5)).await {
        HandshakeOutcome::Ready { server_info } => {
            assert_eq!(server_info["serverInfo"]["name"], json!("mock"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    assert!(bridge.is_alive());
    assert!(bridge.pid() > 0);
    bridge.shutdown(Duration::from_secs(1), false).await;
    assert!(!bridge.is_alive());
    Ok(())
}

#[tokio::test]
async fn test_handshake_reports_early_exit() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "exit.sh", "echo 'missing dependency' >&2\nexit 3\n");
    let bridge = ProtocolBridge::spawn(&script_config("broken", &script))?;

    let outcome = bridge.handshake(Duration::from_secs(5)).await;

    assert_eq!(outcome, HandshakeOutcome::Exited { code: Some(3) });
    assert!(!outcome.is_ready());
    assert!(outcome.reason().contains("code 3"));
    Ok(())
}

#[tokio::test]
async fn test_raw_text_server_times_out() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "raw.sh", &raw_echo_script());
    let bridge = ProtocolBridge::spawn(&script_config("raw", &script))?;

    let outcome = bridge.handshake(Duration::from_millis(500)).await;

    assert_eq!(outcome, HandshakeOutcome::TimedOut);
    assert!(matches!(
        outcome.into_result(Duration::from_millis(500)),
        Err(Error::HandshakeTimeout(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_stderr_tail_is_kept() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let body = format!("echo 'booting' >&2\n{}", mock_server_script());
    let script = write_script(dir.path(), "noisy.sh", &body);
    let bridge = ProtocolBridge::spawn(&script_config("noisy", &script))?;

    assert!(bridge.handshake(Duration::from_secs(5)).await.is_ready());
    // The drain task runs independently of the handshake
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(bridge.recent_stderr(), vec!["booting".to_string()]);
    Ok(())
}

#[tokio::test]
async fn test_request_returns_response_verbatim() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let bridge = ready_bridge(&dir).await?;

    let response = bridge
        .request(json!({"jsonrpc": "2.0", "id": 42, "method": "tools/list"}))
        .await?;

    assert_eq!(response["id"], json!(42));
    assert_eq!(response["result"]["tools"][0]["name"], json!("echo"));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_requests_never_cross() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let bridge = ready_bridge(&dir).await?;

    let slow = bridge.request(json!({"jsonrpc": "2.0", "id": "a", "method": "slow"}));
    let fast = bridge.request(json!({"jsonrpc": "2.0", "id": "b", "method": "ping"}));
    let (slow, fast) = tokio::join!(slow, fast);

    let (slow, fast) = (slow?, fast?);
    assert_eq!(slow["id"], json!("a"));
    assert_eq!(slow["result"]["echo"], json!("a"));
    assert_eq!(fast["id"], json!("b"));
    assert_eq!(fast["result"]["echo"], json!("b"));
    Ok(())
}

#[tokio::test]
async fn test_abandoned_request_does_not_desync() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let bridge = ready_bridge(&dir).await?;

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        bridge.request(json!({"jsonrpc": "2.0", "id": "late", "method": "slow"})),
    )
    .await;
    assert!(abandoned.is_err());

    let response = bridge
        .request(json!({"jsonrpc": "2.0", "id": "next", "method": "ping"}))
        .await?;
    assert_eq!(response["id"], json!("next"));
    Ok(())
}

#[tokio::test]
async fn test_call_maps_error_response() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let bridge = ready_bridge(&dir).await?;

    let tools = bridge.call("tools/list", None).await?;
    assert_eq!(tools["tools"][0]["name"], json!("echo"));

    match bridge.call("fail", None).await {
        Err(Error::JsonRpc { code, message }) => {
            assert_eq!(code, -32601);
            assert_eq!(message, "Method not found");
        }
        other => panic!("expected JSON-RPC error, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_stream_yields_raw_lines_and_notifications() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let bridge = ready_bridge(&dir).await?;

    let mut events = bridge
        .stream(json!({"jsonrpc": "2.0", "id": "s1", "method": "chatty"}))
        .await?;

    let mut received = Vec::new();
    while let Some(event) = events.recv().await {
        received.push(event);
    }

    assert_eq!(received.len(), 3);
    assert_eq!(received[0], StreamEvent::Raw("progress 50%".to_string()));
    assert!(matches!(&received[1], StreamEvent::Message(m) if m["method"] == json!("notifications/progress")));
    assert!(matches!(&received[2], StreamEvent::Message(m) if m["result"]["done"] == json!(true)));

    // The pipe is clean for the next exchange
    let response = bridge
        .request(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
        .await?;
    assert_eq!(response["id"], json!(1));
    Ok(())
}

#[tokio::test]
async fn test_exit_mid_request_is_transport_loss() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let bridge = ready_bridge(&dir).await?;

    let result = bridge
        .request(json!({"jsonrpc": "2.0", "id": 9, "method": "die"}))
        .await;

    assert!(matches!(&result, Err(e) if e.is_transport()), "{:?}", result);
    assert!(bridge.is_transport_lost());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!bridge.is_alive());
    assert_eq!(bridge.exit_code(), Some(7));
    Ok(())
}

#[tokio::test]
async fn test_notify_needs_no_response() -> Result<()> {
    let dir = TempDir::new().unwrap();
    let bridge = ready_bridge(&dir).await?;

    bridge
        .notify(json!({"jsonrpc": "2.0", "method": "notifications/cancelled"}))
        .await?;

    let response = bridge
        .request(json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}))
        .await?;
    assert_eq!(response["id"], json!(2));
    Ok(())
}

#[tokio::test]
async fn test_spawn_failure_is_reported() {
    let config = mcp_gateway::config::ServerConfig::new("ghost", "/nonexistent/mcp-server", vec![]);
    let result = ProtocolBridge::spawn(&config);
    assert!(matches!(result, Err(Error::Spawn(_))));
}
