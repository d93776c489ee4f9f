//! Plugin contract and registration context.
//!
//! Plugins register synchronously, in the order they were added to the
//! shell. Registration wires capabilities (job handlers, bus
//! subscriptions, services); actual background work only begins after
//! the shell's `system:plugins:ready` broadcast completes.

use std::sync::Arc;

use anyhow::Result;
use switchboard::MessageBus;

use super::jobs::{BatchJobManager, JobHandler, JobQueueService};
use super::registry::ServiceRegistry;

/// What a plugin exposed during registration.
#[derive(Debug, Clone, Default)]
pub struct PluginCapabilities {
    /// Tool names the plugin offers to outer surfaces.
    pub tools: Vec<String>,
    /// Resource names the plugin serves.
    pub resources: Vec<String>,
}

impl PluginCapabilities {
    pub fn none() -> Self {
        Self::default()
    }
}

/// A loosely coupled component that extends the shell.
pub trait Plugin: Send + Sync {
    /// Stable identifier; namespaces the plugin's job types and handler
    /// registrations.
    fn id(&self) -> &str;

    /// Called once during `Shell::initialize`, before background work
    /// starts. Must not block on background services.
    fn register(&mut self, ctx: &mut PluginContext<'_>) -> Result<PluginCapabilities>;
}

/// Registration-time view of the shell, scoped to one plugin.
pub struct PluginContext<'a> {
    plugin_id: String,
    bus: &'a MessageBus,
    services: &'a Arc<ServiceRegistry>,
    jobs: &'a Arc<JobQueueService>,
    batches: &'a Arc<BatchJobManager>,
}

impl<'a> PluginContext<'a> {
    pub(crate) fn new(
        plugin_id: impl Into<String>,
        bus: &'a MessageBus,
        services: &'a Arc<ServiceRegistry>,
        jobs: &'a Arc<JobQueueService>,
        batches: &'a Arc<BatchJobManager>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            bus,
            services,
            jobs,
            batches,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn bus(&self) -> &MessageBus {
        self.bus
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        self.services
    }

    pub fn jobs(&self) -> &Arc<JobQueueService> {
        self.jobs
    }

    pub fn batches(&self) -> &Arc<BatchJobManager> {
        self.batches
    }

    /// Register a job handler under this plugin's namespace.
    pub fn register_job_handler(&self, kind: &str, handler: Arc<dyn JobHandler>) {
        self.jobs.register_handler(kind, handler, &self.plugin_id);
    }
}
