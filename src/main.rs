use anyhow::Context;
use mcp_gateway::McpGateway;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "gateway.json".to_string());
    tracing::info!(config_path = %config_path, "Starting MCP gateway");

    let mut gateway = McpGateway::from_config_file(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path))?;

    gateway.start().await.context("failed to start gateway")?;
    if let Some(addr) = gateway.local_addr() {
        tracing::info!(address = %addr, "Gateway listening");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    gateway.shutdown().await.context("failed to shut down cleanly")?;
    Ok(())
}
