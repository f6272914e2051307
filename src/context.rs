//! Shared gateway context.
//!
//! Constructed once at startup and handed to every component by `Arc`, so
//! the process registry, metrics and settings never live in global state.

use crate::config::{ConfigStore, GatewaySettings};
use crate::error::Result;
use crate::metrics::MetricsRegistry;
use crate::server::{LifecycleJournal, RestartEngine};
use std::sync::Arc;

/// Everything the supervisor, monitor and router share
pub struct GatewayContext {
    /// Gateway-wide settings
    pub settings: GatewaySettings,
    /// Configuration and instance-state persistence
    pub store: Arc<dyn ConfigStore>,
    /// Metrics registry
    pub metrics: MetricsRegistry,
    /// Restart history and policy checks
    pub restarts: RestartEngine,
    /// Lifecycle event journal
    pub journal: LifecycleJournal,
}

impl GatewayContext {
    /// Build a context around `store`
    pub fn new(settings: GatewaySettings, store: Arc<dyn ConfigStore>) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            settings,
            store,
            metrics: MetricsRegistry::new()?,
            restarts: RestartEngine::new(),
            journal: LifecycleJournal::new(),
        }))
    }
}
