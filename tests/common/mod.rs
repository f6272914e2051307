#![allow(dead_code)]

use mcp_gateway::config::{GatewaySettings, MemoryConfigStore, ServerConfig};
use mcp_gateway::context::GatewayContext;
use mcp_gateway::server::ProcessSupervisor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Extracts the top-level JSON-RPC id of `$line` into `$id`
const READ_ID: &str = r#"id=$(printf '%s' "$line" | grep -o '"id":[^,}]*' | head -n1 | cut -d: -f2-)"#;

/// Answers `initialize` and `tools/list`, echoes the id for anything else.
/// A `slow` method sleeps before answering; `die` exits without answering.
pub fn mock_server_script() -> String {
    format!(
        r#"
while IFS= read -r line; do
  {READ_ID}
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"protocolVersion":"2024-11-05","capabilities":{{}},"serverInfo":{{"name":"mock","version":"1.0"}}}}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"tools":[{{"name":"echo","description":"Echo"}}]}}}}\n' "$id" ;;
    *'"method":"slow"'*)
      sleep 0.3
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"echo":%s}}}}\n' "$id" "$id" ;;
    *'"method":"chatty"'*)
      printf 'progress 50%%\n'
      printf '{{"jsonrpc":"2.0","method":"notifications/progress","params":{{"progress":50}}}}\n'
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"done":true}}}}\n' "$id" ;;
    *'"method":"fail"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"error":{{"code":-32601,"message":"Method not found"}}}}\n' "$id" ;;
    *'"method":"die"'*)
      exit 7 ;;
    *)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"echo":%s}}}}\n' "$id" "$id" ;;
  esac
done
"#
    )
}

/// Like `mock_server_script`, but `tools/list` answers with an error
pub fn broken_tools_script() -> String {
    let script = mock_server_script().replace(
        r#""result":{"tools":[{"name":"echo","description":"Echo"}]}}"#,
        r#""error":{"code":-32603,"message":"tools unavailable"}}"#,
    );
    assert!(script.contains("tools unavailable"));
    script
}

/// Like `mock_server_script`, but only the first `die` ever exits; later
/// ones answer `{"survived": true}`. A marker file next to the script
/// remembers the first exit across restarts.
pub fn die_once_script() -> String {
    let script = mock_server_script().replace(
        "      exit 7 ;;",
        r#"      marker="$(dirname "$0")/died"
      if [ ! -e "$marker" ]; then touch "$marker"; exit 7; fi
      printf '{"jsonrpc":"2.0","id":%s,"result":{"survived":true}}\n' "$id" ;;"#,
    );
    assert!(script.contains("survived"));
    script
}

/// Replies to `initialize` only after `delay_secs`
pub fn slow_handshake_script(delay_secs: f32) -> String {
    format!("sleep {}\n{}", delay_secs, mock_server_script())
}

/// Echoes every line back as plain text, never JSON
pub fn raw_echo_script() -> String {
    "while IFS= read -r line; do echo \"got: $line\"; done\n".to_string()
}

/// Writes `body` as a bash script into `dir`
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/bash\n{}", body)).expect("write mock server script");
    path
}

/// A server config that runs `script` through bash
pub fn script_config(id: &str, script: &Path) -> ServerConfig {
    ServerConfig::new(id, "bash", vec![script.display().to_string()])
}

/// Settings with timeouts short enough for tests
pub fn test_settings() -> GatewaySettings {
    GatewaySettings {
        handshake_timeout: Duration::from_secs(5),
        stop_grace: Duration::from_secs(1),
        health_check_timeout: Duration::from_secs(2),
        ..GatewaySettings::default()
    }
}

/// A supervisor over an in-memory store
pub fn supervisor_with(store: MemoryConfigStore) -> Arc<ProcessSupervisor> {
    supervisor_with_settings(store, test_settings())
}

/// A supervisor over an in-memory store with custom settings
pub fn supervisor_with_settings(store: MemoryConfigStore, settings: GatewaySettings) -> Arc<ProcessSupervisor> {
    let ctx = GatewayContext::new(settings, Arc::new(store)).expect("context");
    Arc::new(ProcessSupervisor::new(ctx))
}

/// A supervisor over an empty in-memory store
pub fn supervisor() -> Arc<ProcessSupervisor> {
    supervisor_with(MemoryConfigStore::new())
}
