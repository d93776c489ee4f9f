//! Job queue service: enqueue/complete/fail, the retry policy, and the
//! plugin-namespaced handler registry.
//!
//! The service is the only writer of job rows; the worker and plugins go
//! through it.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::handler::JobHandler;
use super::job::{backoff_delay_ms, namespaced_job_type, ErrorKind, Job, JobStatus};
use super::monitor::JobProgressMonitor;
use super::store::JobStore;

/// Options for enqueueing a job.
#[derive(Clone, Debug, TypedBuilder)]
pub struct EnqueueOptions {
    /// Higher runs first among ready jobs.
    #[builder(default = 0)]
    pub priority: i64,
    #[builder(default = 3)]
    pub max_retries: i32,
    /// When to first run the job. `None` means now.
    #[builder(default, setter(strip_option))]
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Caller context carried on the job row.
    #[builder(default = serde_json::json!({}))]
    pub metadata: Value,
    /// Identifies the enqueuer; defaults to the plugin id.
    #[builder(default, setter(strip_option, into))]
    pub source: Option<String>,
    /// Membership in a batch, set by the batch manager.
    #[builder(default, setter(strip_option, into))]
    pub batch_id: Option<String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Queue counters by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobQueueStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

impl JobQueueStats {
    pub fn total(&self) -> i64 {
        self.pending + self.running + self.completed + self.failed
    }
}

pub struct JobQueueService {
    store: Arc<dyn JobStore>,
    handlers: DashMap<String, Arc<dyn JobHandler>>,
    monitor: Arc<JobProgressMonitor>,
    retry_base_delay_ms: i64,
}

impl JobQueueService {
    pub fn new(
        store: Arc<dyn JobStore>,
        monitor: Arc<JobProgressMonitor>,
        retry_base_delay_ms: i64,
    ) -> Self {
        Self {
            store,
            handlers: DashMap::new(),
            monitor,
            retry_base_delay_ms,
        }
    }

    pub fn monitor(&self) -> &Arc<JobProgressMonitor> {
        &self.monitor
    }

    /// Build a job row without persisting it. Used by the batch manager
    /// to learn job ids before its record is written.
    pub fn prepare(
        &self,
        job_type: &str,
        data: Value,
        options: EnqueueOptions,
        plugin_id: &str,
    ) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            job_type: namespaced_job_type(plugin_id, job_type),
            data,
            status: JobStatus::Pending,
            priority: options.priority,
            scheduled_for: options.scheduled_for.unwrap_or(now),
            created_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: options.max_retries,
            last_error: None,
            result: None,
            metadata: options.metadata,
            source: options.source.unwrap_or_else(|| plugin_id.to_string()),
            batch_id: options.batch_id,
        }
    }

    /// Persist a prepared job.
    pub async fn submit(&self, job: Job) -> Result<Uuid> {
        let id = job.id;
        debug!(job_id = %id, job_type = %job.job_type, "enqueueing job");
        self.store.insert(&job).await?;
        Ok(id)
    }

    /// Enqueue a job. The type is namespaced with `plugin_id:` unless it
    /// already carries a namespace.
    pub async fn enqueue(
        &self,
        job_type: &str,
        data: Value,
        options: EnqueueOptions,
        plugin_id: &str,
    ) -> Result<Uuid> {
        self.submit(self.prepare(job_type, data, options, plugin_id))
            .await
    }

    /// Claim the next due job for a worker slot; notifies the monitor.
    pub async fn claim_next(&self) -> Result<Option<Job>> {
        let Some(job) = self.store.claim_next(Utc::now()).await? else {
            return Ok(None);
        };
        self.monitor.job_started(&job).await;
        Ok(Some(job))
    }

    /// Mark a job completed with its result.
    pub async fn complete(&self, job_id: Uuid, result: Value) -> Result<()> {
        self.store.mark_completed(job_id, &result).await?;
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| anyhow!("job not found: {}", job_id))?;
        info!(job_id = %job_id, job_type = %job.job_type, "job completed");
        self.monitor.job_completed(&job, &result).await;
        Ok(())
    }

    /// Mark a job failed. Retryable failures with attempts left re-enter
    /// pending, deferred by exponential backoff; everything else is
    /// terminal.
    pub async fn fail(&self, job_id: Uuid, error: &str, kind: ErrorKind) -> Result<()> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or_else(|| anyhow!("job not found: {}", job_id))?;

        let will_retry = kind.should_retry() && job.has_retries_left();
        if will_retry {
            let attempt = job.retry_count + 1;
            let delay_ms = backoff_delay_ms(self.retry_base_delay_ms, attempt);
            let run_at = Utc::now() + chrono::Duration::milliseconds(delay_ms);
            self.store.schedule_retry(job_id, error, run_at).await?;
            info!(
                job_id = %job_id,
                job_type = %job.job_type,
                attempt,
                delay_ms,
                "job failed, retry scheduled"
            );
            self.monitor.job_failed(&job, error, attempt, true).await;
        } else {
            self.store.mark_failed(job_id, error).await?;
            info!(job_id = %job_id, job_type = %job.job_type, error = %error, "job failed terminally");
            self.monitor
                .job_failed(&job, error, job.retry_count, false)
                .await;
        }
        Ok(())
    }

    /// Register a handler for `pluginId:kind`.
    pub fn register_handler(&self, kind: &str, handler: Arc<dyn JobHandler>, plugin_id: &str) {
        let job_type = namespaced_job_type(plugin_id, kind);
        debug!(job_type = %job_type, "registering job handler");
        self.handlers.insert(job_type, handler);
    }

    /// Remove every handler registered under a plugin's namespace.
    pub fn unregister_plugin_handlers(&self, plugin_id: &str) {
        let prefix = format!("{}:", plugin_id);
        self.handlers.retain(|job_type, _| !job_type.starts_with(&prefix));
    }

    pub fn handler_for(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).map(|entry| entry.value().clone())
    }

    pub fn registered_handler_types(&self) -> Vec<String> {
        self.handlers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        self.store.get(job_id).await
    }

    pub async fn status(&self, job_id: Uuid) -> Result<Option<JobStatus>> {
        Ok(self.store.get(job_id).await?.map(|job| job.status))
    }

    pub async fn stats(&self) -> Result<JobQueueStats> {
        let mut stats = JobQueueStats::default();
        for (status, count) in self.store.counts_by_status().await? {
            match status {
                JobStatus::Pending => stats.pending = count,
                JobStatus::Running => stats.running = count,
                JobStatus::Completed => stats.completed = count,
                JobStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }

    /// Pending and running jobs, optionally restricted to one type.
    pub async fn active_jobs(&self, job_type: Option<&str>) -> Result<Vec<Job>> {
        self.store.active_jobs(job_type).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::store::SqliteJobStore;
    use crate::kernel::jobs::TypedJobHandler;
    use serde_json::json;
    use switchboard::MessageBus;

    async fn service() -> JobQueueService {
        let store = Arc::new(SqliteJobStore::in_memory().await.unwrap());
        let monitor = Arc::new(JobProgressMonitor::new(MessageBus::new(), None, None));
        monitor.enable();
        JobQueueService::new(store, monitor, 50)
    }

    fn noop_handler() -> Arc<dyn JobHandler> {
        Arc::new(TypedJobHandler::<Value, _>::new(
            |_data, _id, _progress| async move { Ok(json!(null)) },
        ))
    }

    #[tokio::test]
    async fn enqueue_namespaces_job_type() {
        let service = service().await;
        let id = service
            .enqueue("embed", json!({}), EnqueueOptions::default(), "notes")
            .await
            .unwrap();

        let job = service.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.job_type, "notes:embed");
        assert_eq!(job.source, "notes");

        let id = service
            .enqueue("other:embed", json!({}), EnqueueOptions::default(), "notes")
            .await
            .unwrap();
        let job = service.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.job_type, "other:embed");
    }

    #[tokio::test]
    async fn retryable_failure_requeues_with_backoff() {
        let service = service().await;
        let id = service
            .enqueue("embed", json!({}), EnqueueOptions::default(), "notes")
            .await
            .unwrap();
        let before = Utc::now();
        service.claim_next().await.unwrap().unwrap();

        service.fail(id, "transient", ErrorKind::Retryable).await.unwrap();

        let job = service.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.last_error.as_deref(), Some("transient"));
        // First retry is deferred by the base delay.
        assert!(job.scheduled_for >= before + chrono::Duration::milliseconds(50));
    }

    #[tokio::test]
    async fn exhausted_retries_are_terminal() {
        let service = service().await;
        let id = service
            .enqueue(
                "embed",
                json!({}),
                EnqueueOptions::builder().max_retries(1).build(),
                "notes",
            )
            .await
            .unwrap();

        service.claim_next().await.unwrap().unwrap();
        service.fail(id, "first", ErrorKind::Retryable).await.unwrap();
        assert_eq!(
            service.status(id).await.unwrap(),
            Some(JobStatus::Pending)
        );

        // Second failure exceeds max_retries = 1.
        service.fail(id, "second", ErrorKind::Retryable).await.unwrap();
        let job = service.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn non_retryable_failure_is_immediately_terminal() {
        let service = service().await;
        let id = service
            .enqueue("embed", json!({}), EnqueueOptions::default(), "notes")
            .await
            .unwrap();
        service.claim_next().await.unwrap().unwrap();

        service
            .fail(id, "invalid payload", ErrorKind::NonRetryable)
            .await
            .unwrap();
        assert_eq!(service.status(id).await.unwrap(), Some(JobStatus::Failed));
    }

    #[tokio::test]
    async fn complete_records_result() {
        let service = service().await;
        let id = service
            .enqueue("embed", json!({}), EnqueueOptions::default(), "notes")
            .await
            .unwrap();
        service.claim_next().await.unwrap().unwrap();
        service.complete(id, json!({"vectors": 3})).await.unwrap();

        let job = service.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!({"vectors": 3})));
    }

    #[tokio::test]
    async fn handler_registry_is_namespaced() {
        let service = service().await;
        service.register_handler("embed", noop_handler(), "notes");
        service.register_handler("publish", noop_handler(), "site");

        assert!(service.handler_for("notes:embed").is_some());
        assert!(service.handler_for("site:publish").is_some());
        assert!(service.handler_for("notes:publish").is_none());

        service.unregister_plugin_handlers("notes");
        assert!(service.handler_for("notes:embed").is_none());
        assert!(service.handler_for("site:publish").is_some());
    }

    #[tokio::test]
    async fn stats_count_by_status() {
        let service = service().await;
        service
            .enqueue("a", json!({}), EnqueueOptions::default(), "notes")
            .await
            .unwrap();
        service
            .enqueue("b", json!({}), EnqueueOptions::default(), "notes")
            .await
            .unwrap();
        let claimed = service.claim_next().await.unwrap().unwrap();
        service.complete(claimed.id, json!(null)).await.unwrap();

        let stats = service.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.total(), 2);
    }
}
