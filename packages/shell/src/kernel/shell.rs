//! Shell: the assembly root that wires the bus, job queue, batch
//! manager, and publish scheduler, and enforces startup ordering.
//!
//! The order in `initialize` is load-bearing: jobs persisted from a
//! prior run must not execute before plugin `system:plugins:ready`
//! handlers complete (they may register entity adapters, prime caches,
//! or perform initial sync). The worker and the progress monitor
//! therefore start strictly after the broadcast resolves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use switchboard::MessageBus;
use tracing::{info, warn};

use crate::config::ShellConfig;
use crate::kernel::jobs::{
    BatchJobManager, BatchStore, JobProgressMonitor, JobQueueService, JobQueueWorker, JobStore,
    SqliteJobStore,
};
use crate::kernel::plugin::{Plugin, PluginContext};
use crate::kernel::publish::{EmptyContentResolver, PublishScheduler};
use crate::kernel::registry::ServiceRegistry;
use crate::kernel::topics;

pub struct Shell {
    bus: MessageBus,
    services: Arc<ServiceRegistry>,
    store: Arc<SqliteJobStore>,
    jobs: Arc<JobQueueService>,
    worker: Arc<JobQueueWorker>,
    batches: Arc<BatchJobManager>,
    scheduler: PublishScheduler,
    plugins: Vec<Box<dyn Plugin>>,
    initialized: AtomicBool,
}

impl Shell {
    /// Build the shell's object graph from configuration. Nothing runs
    /// yet; call [`Shell::initialize`] to register plugins and open the
    /// startup gate.
    pub async fn new(config: ShellConfig) -> Result<Self> {
        let bus = MessageBus::new();
        let services = Arc::new(ServiceRegistry::new());

        let store = Arc::new(
            SqliteJobStore::connect(&config.database_url)
                .await
                .context("failed to open job store")?,
        );

        let monitor = Arc::new(JobProgressMonitor::new(
            bus.clone(),
            Some(store.clone() as Arc<dyn BatchStore>),
            Some(store.clone() as Arc<dyn JobStore>),
        ));
        let jobs = Arc::new(JobQueueService::new(
            store.clone() as Arc<dyn JobStore>,
            monitor,
            config.job_retry_base_delay_ms,
        ));
        let worker = Arc::new(JobQueueWorker::new(jobs.clone(), config.worker.clone()));
        let batches = Arc::new(BatchJobManager::new(
            store.clone() as Arc<dyn BatchStore>,
            store.clone() as Arc<dyn JobStore>,
            jobs.clone(),
        ));

        // Message mode: plugins perform the publish and report back.
        let scheduler = PublishScheduler::new(
            config.publish.clone(),
            Arc::new(EmptyContentResolver),
            Some(bus.clone()),
        )
        .context("failed to build publish scheduler")?;

        Ok(Self {
            bus,
            services,
            store,
            jobs,
            worker,
            batches,
            scheduler,
            plugins: Vec::new(),
            initialized: AtomicBool::new(false),
        })
    }

    /// Add a plugin. Registration order is preserved and decides the
    /// order of `register` calls during initialization.
    pub fn register_plugin(&mut self, plugin: Box<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    /// Register plugins, announce readiness, then start background work.
    ///
    /// Steps, in order:
    /// 1. Every plugin's `register` runs synchronously.
    /// 2. Core services go into the registry.
    /// 3. The shell marks itself initialized.
    /// 4. `system:plugins:ready` is broadcast and every handler is
    ///    awaited.
    /// 5. Only then do the worker, monitor, and publish scheduler start.
    pub async fn initialize(&mut self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut plugins = std::mem::take(&mut self.plugins);
        for plugin in &mut plugins {
            let plugin_id = plugin.id().to_string();
            let mut ctx = PluginContext::new(
                plugin_id.clone(),
                &self.bus,
                &self.services,
                &self.jobs,
                &self.batches,
            );
            let capabilities = plugin
                .register(&mut ctx)
                .with_context(|| format!("plugin registration failed: {}", plugin_id))?;
            info!(
                plugin_id = %plugin_id,
                tools = capabilities.tools.len(),
                resources = capabilities.resources.len(),
                "plugin registered"
            );
        }
        self.plugins = plugins;

        self.register_core_services();
        self.initialized.store(true, Ordering::SeqCst);

        // Await every ready handler before any background work begins.
        let outcome = self
            .bus
            .broadcast(topics::SYSTEM_PLUGINS_READY, json!({}), "shell")
            .await;
        if let Some(response) = outcome.response() {
            if !response.success {
                warn!(
                    error = response.error.as_deref().unwrap_or("unknown"),
                    "some plugins:ready handlers failed"
                );
            }
        }

        self.jobs.monitor().enable();
        self.worker.start().await;
        self.scheduler.start().await?;

        info!("shell initialized, background services started");
        Ok(())
    }

    /// Stop background services gracefully; in-flight work completes.
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.stop().await?;
        self.worker.stop().await;
        info!("shell shut down");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    pub fn jobs(&self) -> &Arc<JobQueueService> {
        &self.jobs
    }

    pub fn worker(&self) -> &Arc<JobQueueWorker> {
        &self.worker
    }

    pub fn batches(&self) -> &Arc<BatchJobManager> {
        &self.batches
    }

    pub fn publish_scheduler(&self) -> &PublishScheduler {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<SqliteJobStore> {
        &self.store
    }

    fn register_core_services(&self) {
        self.services
            .register_instance("job-queue", self.jobs.clone());
        self.services
            .register_instance("batch-manager", self.batches.clone());
        self.services
            .register_instance("message-bus", Arc::new(self.bus.clone()));
    }
}
