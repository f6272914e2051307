/// Server management for the gateway.
///
/// This module owns MCP server processes and their lifecycle: spawning,
/// the state machine, restart policy, health monitoring and the event
/// journal. All public lifecycle operations are instrumented with `tracing`
/// spans.
///
/// # Components
///
/// * `supervisor` - Starts, stops and restarts processes under per-id locks
/// * `monitor` - Health monitoring and automatic recovery of servers
/// * `restart` - Restart eligibility and backoff
/// * `state` - Lifecycle states and persisted instance records
/// * `lifecycle` - Bounded journal of lifecycle events
/// * `process` - Process spawning, environment and termination
///
/// # Examples
///
/// ```no_run
/// use mcp_gateway::config::{GatewaySettings, MemoryConfigStore, ServerConfig};
/// use mcp_gateway::context::GatewayContext;
/// use mcp_gateway::server::{ProcessSupervisor, ServerMonitor, ServerMonitorConfig};
/// use std::sync::Arc;
///
/// # async fn run() -> mcp_gateway::Result<()> {
/// let ctx = GatewayContext::new(GatewaySettings::default(), Arc::new(MemoryConfigStore::new()))?;
/// let supervisor = Arc::new(ProcessSupervisor::new(ctx));
///
/// let config = ServerConfig::new("fetch", "uvx", vec!["mcp-server-fetch".to_string()]);
/// supervisor.start("fetch", Some(config)).await?;
///
/// let mut monitor = ServerMonitor::new(Arc::clone(&supervisor), ServerMonitorConfig::default());
/// monitor.start()?;
/// # Ok(())
/// # }
/// ```
pub mod lifecycle;
pub mod monitor;
pub mod process;
pub mod restart;
pub mod state;
pub mod supervisor;

pub use lifecycle::{LifecycleJournal, ServerEvent, ServerLifecycleEvent};
pub use monitor::{HealthReport, ServerHealth, ServerMonitor, ServerMonitorConfig};
pub use process::{ExitInfo, ProcessHandle};
pub use restart::{RestartDecision, RestartEngine, compute_delay};
pub use state::{InstanceState, ServerState};
pub use supervisor::{ProcessSupervisor, ServerSnapshot, StopOutcome};
