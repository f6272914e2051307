/*!
 # MCP Gateway

 A supervisor and HTTP gateway for Model Context Protocol (MCP) servers that
 speak JSON-RPC over stdio.

 ## Overview

 MCP Gateway provides functionality to:
 - Start, stop and restart MCP server processes with per-server locking
 - Monitor their health and restart them under a backoff policy
 - Proxy JSON-RPC requests to them over HTTP, synchronously or as SSE
 - Persist configuration and instance state, and export Prometheus metrics

 ## Basic Usage

 ```no_run
 use mcp_gateway::{McpGateway, Result};

 #[tokio::main]
 async fn main() -> Result<()> {
     let mut gateway = McpGateway::from_config_file("gateway.json")?;

     // Start servers, the health monitor and the HTTP listener
     gateway.start().await?;

     tokio::signal::ctrl_c().await.ok();
     gateway.shutdown().await
 }
 ```
*/

pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod server;
pub mod transport;

pub use config::Config;
pub use context::GatewayContext;
pub use error::{Error, Result};
pub use gateway::{GatewayHandle, GatewayRouter};
pub use server::{ProcessSupervisor, ServerMonitor, ServerState, StopOutcome};
pub use transport::ProtocolBridge;

use config::{ConfigStore, FileConfigStore, validate_config};
use server::ServerMonitorConfig;
use std::path::Path;
use std::sync::Arc;

/// Wires the store, supervisor, health monitor and HTTP gateway together.
///
/// All public methods are instrumented with `tracing` spans.
pub struct McpGateway {
    ctx: Arc<GatewayContext>,
    supervisor: Arc<ProcessSupervisor>,
    monitor: ServerMonitor,
    http: Option<GatewayHandle>,
}

impl McpGateway {
    /// Load and validate a configuration file; instance state is persisted
    /// next to it unless `gateway.state_file` says otherwise.
    #[tracing::instrument(skip(path), fields(config_path = ?path.as_ref()))]
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        tracing::info!("Loading configuration from file");
        let path = path.as_ref();
        let config = Config::from_file(path)?;
        validate_config(&config)?;

        let store = FileConfigStore::new(path, config.gateway.state_file.clone());
        Self::with_store(config, Arc::new(store))
    }

    /// Build a gateway over an arbitrary store
    #[tracing::instrument(skip(config, store), fields(num_servers = config.mcp_servers.len()))]
    pub fn with_store(config: Config, store: Arc<dyn ConfigStore>) -> Result<Self> {
        let ctx = GatewayContext::new(config.gateway.clone(), store)?;
        let supervisor = Arc::new(ProcessSupervisor::new(Arc::clone(&ctx)));
        let monitor = ServerMonitor::new(
            Arc::clone(&supervisor),
            ServerMonitorConfig::from_settings(&ctx.settings),
        );

        Ok(Self {
            ctx,
            supervisor,
            monitor,
            http: None,
        })
    }

    /// Shared context
    pub fn context(&self) -> &Arc<GatewayContext> {
        &self.ctx
    }

    /// Process supervisor
    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// Health monitor
    pub fn monitor(&self) -> &ServerMonitor {
        &self.monitor
    }

    /// Address of the HTTP listener, once started
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.http.as_ref().map(GatewayHandle::local_addr)
    }

    /// Restore instance state, start enabled servers, then the monitor and
    /// the HTTP listener. Individual server failures do not abort startup.
    #[tracing::instrument(skip(self))]
    pub async fn start(&mut self) -> Result<()> {
        if let Err(e) = self.supervisor.restore().await {
            tracing::warn!(error = %e, "Failed to restore instance state");
        }

        let results = self.supervisor.start_all().await?;
        for (id, started) in &results {
            if !*started {
                tracing::warn!(server_id = %id, "Server did not start");
            }
        }

        self.monitor.start()?;

        let router = GatewayRouter::new(Arc::clone(&self.supervisor));
        self.http = Some(gateway::start(router, &self.ctx.settings).await?);
        Ok(())
    }

    /// Stop the HTTP listener, the monitor and every server
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&mut self) -> Result<()> {
        tracing::info!("Shutting down gateway");

        if let Some(http) = self.http.take() {
            if let Err(e) = http.shutdown().await {
                tracing::warn!(error = %e, "Error shutting down HTTP listener");
            }
        }

        self.monitor.stop()?;

        for (id, stopped) in self.supervisor.stop_all().await {
            if !stopped {
                tracing::warn!(server_id = %id, "Server did not stop cleanly");
            }
        }

        tracing::info!("Gateway stopped");
        Ok(())
    }
}
