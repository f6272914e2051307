//! Process-wide metrics in the Prometheus text exposition format.
//!
//! A single [`MetricsRegistry`] is created with the [`GatewayContext`] and
//! shared by reference; nothing registers into the global default registry.
//!
//! [`GatewayContext`]: crate::context::GatewayContext

use crate::error::Result;
use crate::server::ServerState;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Methods that keep their own `method` label
const LABELLED_METHODS: &[&str] = &[
    "initialize",
    "ping",
    "tools/list",
    "tools/call",
    "resources/list",
    "resources/read",
    "resources/templates/list",
    "prompts/list",
    "prompts/get",
    "completion/complete",
    "logging/setLevel",
];

/// `method` label for a client-supplied method name. Anything outside the
/// MCP method set folds into `notification` or `other`, so clients cannot
/// mint new series.
pub fn method_label(method: &str) -> &'static str {
    if let Some(known) = LABELLED_METHODS.iter().find(|known| **known == method) {
        return *known;
    }
    if method.starts_with("notifications/") {
        "notification"
    } else {
        "other"
    }
}

/// Counters, gauges and histograms exported by the gateway
pub struct MetricsRegistry {
    registry: Registry,
    server_status: IntGaugeVec,
    servers_running: IntGauge,
    restarts: IntCounterVec,
    health_checks: IntCounterVec,
    requests: IntCounterVec,
    request_duration: HistogramVec,
}

impl MetricsRegistry {
    /// Create and register all gateway metrics
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("mcp_gateway".to_string()), None)?;

        let server_status = IntGaugeVec::new(
            Opts::new(
                "server_status",
                "Lifecycle state code per server (0=stopped .. 7=failed)",
            ),
            &["server_id"],
        )?;
        let servers_running = IntGauge::new("servers_running", "Servers with a live process")?;
        let restarts = IntCounterVec::new(
            Opts::new("server_restarts_total", "Automatic restarts per server"),
            &["server_id"],
        )?;
        let health_checks = IntCounterVec::new(
            Opts::new("health_checks_total", "Health check results per server"),
            &["server_id", "result"],
        )?;
        let requests = IntCounterVec::new(
            Opts::new("requests_total", "Proxied JSON-RPC requests"),
            &["server_id", "method", "outcome"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "request_duration_seconds",
                "Latency of proxied JSON-RPC requests",
            ),
            &["server_id", "method"],
        )?;

        registry.register(Box::new(server_status.clone()))?;
        registry.register(Box::new(servers_running.clone()))?;
        registry.register(Box::new(restarts.clone()))?;
        registry.register(Box::new(health_checks.clone()))?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            registry,
            server_status,
            servers_running,
            restarts,
            health_checks,
            requests,
            request_duration,
        })
    }

    /// Set the status gauge of `server_id`
    pub fn set_status(&self, server_id: &str, state: ServerState) {
        self.server_status
            .with_label_values(&[server_id])
            .set(state.metric_value());
    }

    /// Set the number of servers with a live process
    pub fn set_running(&self, count: usize) {
        self.servers_running.set(count as i64);
    }

    /// Count an automatic restart
    pub fn inc_restarts(&self, server_id: &str) {
        self.restarts.with_label_values(&[server_id]).inc();
    }

    /// Count a health check result
    pub fn observe_health(&self, server_id: &str, result: &str) {
        self.health_checks
            .with_label_values(&[server_id, result])
            .inc();
    }

    /// Count a proxied request and record its latency. `server_id` must be
    /// a configured server; `method` is folded through [`method_label`].
    pub fn observe_request(&self, server_id: &str, method: &str, outcome: &str, elapsed: Duration) {
        let method = method_label(method);
        self.requests
            .with_label_values(&[server_id, method, outcome])
            .inc();
        self.request_duration
            .with_label_values(&[server_id, method])
            .observe(elapsed.as_secs_f64());
    }

    /// Render every metric in the text exposition format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| crate::Error::Metrics(e.to_string()))
    }
}
