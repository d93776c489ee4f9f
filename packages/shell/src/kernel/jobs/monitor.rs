//! Job progress monitor: forwards job lifecycle transitions onto the
//! message bus, including batch aggregation events for batch members.
//!
//! The monitor is disabled until the startup gate opens (after the
//! `system:plugins:ready` broadcast completes), so jobs persisted from a
//! prior run cannot surface events before plugins are ready to hear
//! them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use switchboard::MessageBus;
use tracing::warn;
use uuid::Uuid;

use super::batch::{aggregate_batch, BatchState};
use super::job::Job;
use super::store::{BatchStore, JobStore};
use crate::kernel::topics;

const SOURCE: &str = "job-queue";

pub struct JobProgressMonitor {
    bus: MessageBus,
    batch_store: Option<Arc<dyn BatchStore>>,
    job_store: Option<Arc<dyn JobStore>>,
    enabled: AtomicBool,
}

impl JobProgressMonitor {
    /// Create a monitor. Batch events require both stores; without them
    /// only job-level events are emitted.
    pub fn new(
        bus: MessageBus,
        batch_store: Option<Arc<dyn BatchStore>>,
        job_store: Option<Arc<dyn JobStore>>,
    ) -> Self {
        Self {
            bus,
            batch_store,
            job_store,
            enabled: AtomicBool::new(false),
        }
    }

    /// Open the gate: transitions observed from now on are emitted.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub async fn job_started(&self, job: &Job) {
        if !self.is_enabled() {
            return;
        }
        self.bus
            .broadcast(
                topics::JOB_STARTED,
                json!({
                    "jobId": job.id,
                    "type": job.job_type,
                    "metadata": job.metadata,
                }),
                SOURCE,
            )
            .await;
        self.emit_batch_progress(job.batch_id.as_deref()).await;
    }

    pub async fn job_progress(
        &self,
        job_id: Uuid,
        batch_id: Option<&str>,
        current: u64,
        total: u64,
        message: Option<&str>,
    ) {
        if !self.is_enabled() {
            return;
        }
        self.bus
            .broadcast(
                topics::JOB_PROGRESS,
                json!({
                    "jobId": job_id,
                    "current": current,
                    "total": total,
                    "message": message,
                }),
                SOURCE,
            )
            .await;
        self.emit_batch_progress(batch_id).await;
    }

    pub async fn job_completed(&self, job: &Job, result: &serde_json::Value) {
        if !self.is_enabled() {
            return;
        }
        self.bus
            .broadcast(
                topics::JOB_COMPLETED,
                json!({
                    "jobId": job.id,
                    "result": result,
                }),
                SOURCE,
            )
            .await;
        self.emit_batch_progress(job.batch_id.as_deref()).await;
    }

    pub async fn job_failed(&self, job: &Job, error: &str, retry_count: i32, will_retry: bool) {
        if !self.is_enabled() {
            return;
        }
        self.bus
            .broadcast(
                topics::JOB_FAILED,
                json!({
                    "jobId": job.id,
                    "error": error,
                    "retryCount": retry_count,
                    "willRetry": will_retry,
                }),
                SOURCE,
            )
            .await;
        self.emit_batch_progress(job.batch_id.as_deref()).await;
    }

    /// Aggregate the member jobs and emit `batch:progress`, plus the
    /// terminal `batch:completed` / `batch:failed` event when the batch
    /// just reached its final state.
    async fn emit_batch_progress(&self, batch_id: Option<&str>) {
        let Some(batch_id) = batch_id else {
            return;
        };
        let (Some(batch_store), Some(job_store)) = (&self.batch_store, &self.job_store) else {
            return;
        };

        let record = match batch_store.get_batch(batch_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!(batch_id = %batch_id, error = %e, "failed to load batch for progress event");
                return;
            }
        };
        let jobs = match job_store.jobs_by_ids(&record.job_ids.0).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(batch_id = %batch_id, error = %e, "failed to load batch jobs for progress event");
                return;
            }
        };

        let status = aggregate_batch(&record, &jobs);
        let payload = json!({
            "batchId": status.batch_id,
            "status": status.status.as_str(),
            "totalOperations": status.total_operations,
            "completedOperations": status.completed_operations,
            "failedOperations": status.failed_operations,
            "currentOperation": status.current_operation,
        });

        self.bus
            .broadcast(topics::BATCH_PROGRESS, payload.clone(), SOURCE)
            .await;

        match status.status {
            BatchState::Completed => {
                self.bus
                    .broadcast(topics::BATCH_COMPLETED, payload, SOURCE)
                    .await;
            }
            BatchState::Failed => {
                let mut payload = payload;
                payload["errors"] = json!(status.errors);
                self.bus
                    .broadcast(topics::BATCH_FAILED, payload, SOURCE)
                    .await;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Value;
    use std::sync::Mutex;
    use switchboard::Response;

    fn sample_job(batch_id: Option<&str>) -> Job {
        Job {
            id: Uuid::new_v4(),
            job_type: "notes:embed".to_string(),
            data: json!({}),
            status: super::super::job::JobStatus::Running,
            priority: 0,
            scheduled_for: Utc::now(),
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
            retry_count: 0,
            max_retries: 3,
            last_error: None,
            result: None,
            metadata: json!({"userId": "u1"}),
            source: "tests".to_string(),
            batch_id: batch_id.map(String::from),
        }
    }

    fn capture(bus: &MessageBus, topic: &str) -> Arc<Mutex<Vec<Value>>> {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();
        bus.subscribe(topic, move |msg| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(msg.payload);
                Ok(Response::ok(None))
            }
        });
        captured
    }

    #[tokio::test]
    async fn disabled_monitor_emits_nothing() {
        let bus = MessageBus::new();
        let started = capture(&bus, topics::JOB_STARTED);
        let monitor = JobProgressMonitor::new(bus, None, None);

        monitor.job_started(&sample_job(None)).await;
        assert!(started.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn lifecycle_events_reach_the_bus() {
        let bus = MessageBus::new();
        let started = capture(&bus, topics::JOB_STARTED);
        let progress = capture(&bus, topics::JOB_PROGRESS);
        let completed = capture(&bus, topics::JOB_COMPLETED);
        let failed = capture(&bus, topics::JOB_FAILED);

        let monitor = JobProgressMonitor::new(bus, None, None);
        monitor.enable();

        let job = sample_job(None);
        monitor.job_started(&job).await;
        monitor
            .job_progress(job.id, None, 2, 10, Some("halfway there"))
            .await;
        monitor.job_completed(&job, &json!({"ok": true})).await;
        monitor.job_failed(&job, "transient", 1, true).await;

        let started = started.lock().unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0]["type"], "notes:embed");
        assert_eq!(started[0]["metadata"]["userId"], "u1");

        let progress = progress.lock().unwrap();
        assert_eq!(progress[0]["current"], 2);
        assert_eq!(progress[0]["total"], 10);
        assert_eq!(progress[0]["message"], "halfway there");

        assert_eq!(completed.lock().unwrap()[0]["result"]["ok"], true);

        let failed = failed.lock().unwrap();
        assert_eq!(failed[0]["retryCount"], 1);
        assert_eq!(failed[0]["willRetry"], true);
    }
}
