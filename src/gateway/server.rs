//! HTTP server bootstrap and shutdown handle.

use crate::config::GatewaySettings;
use crate::error::{Error, Result};
use crate::gateway::handlers;
use crate::gateway::router::GatewayRouter;
use actix_cors::Cors;
use actix_web::{
    App, HttpServer, middleware,
    web::{self, Data},
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Register every gateway route on `cfg`
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(handlers::gateway_health))
        .route("/metrics", web::get().to(handlers::metrics))
        .route("/servers", web::get().to(handlers::list_servers))
        .route("/servers/{id}/start", web::post().to(handlers::start_server))
        .route("/servers/{id}/stop", web::post().to(handlers::stop_server))
        .route("/servers/{id}/restart", web::post().to(handlers::restart_server))
        .route("/servers/{id}/events", web::get().to(handlers::server_events))
        .route("/{id}/mcp", web::post().to(handlers::mcp_proxy))
        .route("/{id}/mcp/tools/list", web::get().to(handlers::tools_list))
        .route("/{id}/mcp/tools/call", web::post().to(handlers::tools_call))
        .route("/{id}/sse", web::post().to(handlers::sse_stream))
        .route("/{id}/health", web::get().to(handlers::server_health));
}

/// Handle for a running gateway HTTP server
pub struct GatewayHandle {
    server_handle: actix_web::dev::ServerHandle,
    task: Mutex<Option<JoinHandle<()>>>,
    local_addr: SocketAddr,
}

impl GatewayHandle {
    /// Address the server is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and wait for in-flight requests
    pub async fn shutdown(&self) -> Result<()> {
        self.server_handle.stop(true).await;

        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Err(e)) => tracing::warn!(error = %e, "Error while joining gateway task"),
                Err(_) => tracing::warn!("Timeout waiting for gateway task to finish"),
                Ok(Ok(())) => {}
            }
        }

        tracing::info!("Gateway HTTP server shut down");
        Ok(())
    }
}

/// Start the HTTP gateway on the configured address
#[tracing::instrument(skip(router, settings), fields(address = %settings.bind_address()))]
pub async fn start(router: GatewayRouter, settings: &GatewaySettings) -> Result<GatewayHandle> {
    let addr = settings.socket_addr()?;
    let router = Data::new(router);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(router.clone())
            .configure(configure)
    })
    .workers(settings.workers)
    .bind(addr)
    .map_err(|e| Error::Other(format!("Failed to bind server: {}", e)))?;

    let local_addr = server.addrs().first().copied().unwrap_or(addr);
    let server = server.run();
    let server_handle = server.handle();

    let task = tokio::spawn(async move {
        if let Err(e) = server.await {
            tracing::error!(error = %e, "Gateway HTTP server error");
        }
    });

    tracing::info!(address = %local_addr, workers = settings.workers, "Gateway HTTP server started");

    Ok(GatewayHandle {
        server_handle,
        task: Mutex::new(Some(task)),
        local_addr,
    })
}
