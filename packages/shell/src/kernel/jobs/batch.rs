//! Batch job manager: groups N jobs under one batch id and aggregates
//! their status live from the member jobs.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use super::job::{Job, JobStatus};
use super::service::{EnqueueOptions, JobQueueService};
use super::store::{BatchRecord, BatchStore, JobStore};

/// Derived batch state, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl BatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchState::Completed | BatchState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchState::Queued => "queued",
            BatchState::Processing => "processing",
            BatchState::Completed => "completed",
            BatchState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live aggregation over a batch's member jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatus {
    pub batch_id: String,
    pub plugin_id: String,
    pub status: BatchState,
    pub total_operations: usize,
    pub completed_operations: usize,
    pub failed_operations: usize,
    /// Logical name of the first running operation, if any.
    pub current_operation: Option<String>,
    /// Errors of terminally failed members.
    pub errors: Vec<String>,
}

/// One logical operation inside a batch.
#[derive(Debug, Clone)]
pub struct BatchOperation {
    /// Logical name reported back in `current_operation`.
    pub name: String,
    /// Job kind, namespaced by the enqueueing plugin as usual.
    pub job_type: String,
    pub data: serde_json::Value,
}

impl BatchOperation {
    pub fn new(
        name: impl Into<String>,
        job_type: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            job_type: job_type.into(),
            data,
        }
    }
}

/// Compute the derived status of a batch from its member jobs.
///
/// A batch is terminal when no member is pending or running; it is
/// `Failed` if any member failed terminally, else `Completed`. Counters
/// are always the live aggregation over member jobs.
pub(crate) fn aggregate_batch(record: &BatchRecord, jobs: &[Job]) -> BatchStatus {
    let completed = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Completed)
        .count();
    let failed = jobs.iter().filter(|j| j.status == JobStatus::Failed).count();
    let active = jobs
        .iter()
        .filter(|j| !j.status.is_terminal())
        .count();

    let current_operation = jobs
        .iter()
        .find(|j| j.status == JobStatus::Running)
        .and_then(|j| operation_name(record, j.id));

    let errors = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Failed)
        .filter_map(|j| j.last_error.clone())
        .collect();

    let status = if active == 0 {
        if failed > 0 {
            BatchState::Failed
        } else {
            BatchState::Completed
        }
    } else if jobs.iter().all(|j| j.status == JobStatus::Pending) {
        BatchState::Queued
    } else {
        BatchState::Processing
    };

    BatchStatus {
        batch_id: record.batch_id.clone(),
        plugin_id: record.plugin_id.clone(),
        status,
        total_operations: record.job_ids.0.len(),
        completed_operations: completed,
        failed_operations: failed,
        current_operation,
        errors,
    }
}

fn operation_name(record: &BatchRecord, job_id: Uuid) -> Option<String> {
    let index = record.job_ids.0.iter().position(|id| *id == job_id)?;
    record.operations.0.get(index).cloned()
}

/// Groups jobs under one batch id; owns the batch metadata but only
/// observes the member job rows.
pub struct BatchJobManager {
    batch_store: Arc<dyn BatchStore>,
    job_store: Arc<dyn JobStore>,
    service: Arc<JobQueueService>,
}

impl BatchJobManager {
    pub fn new(
        batch_store: Arc<dyn BatchStore>,
        job_store: Arc<dyn JobStore>,
        service: Arc<JobQueueService>,
    ) -> Self {
        Self {
            batch_store,
            job_store,
            service,
        }
    }

    /// Enqueue every operation as a job under one batch id.
    ///
    /// The batch record is persisted before the member jobs so that a
    /// fast worker can never observe a job whose batch is unknown.
    pub async fn enqueue_batch(
        &self,
        operations: Vec<BatchOperation>,
        options: EnqueueOptions,
        batch_id: Option<String>,
        plugin_id: &str,
    ) -> Result<String> {
        let batch_id = batch_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let jobs: Vec<Job> = operations
            .iter()
            .map(|op| {
                let mut op_options = options.clone();
                op_options.batch_id = Some(batch_id.clone());
                self.service
                    .prepare(&op.job_type, op.data.clone(), op_options, plugin_id)
            })
            .collect();

        let record = BatchRecord {
            batch_id: batch_id.clone(),
            plugin_id: plugin_id.to_string(),
            created_at: Utc::now(),
            job_ids: Json(jobs.iter().map(|j| j.id).collect()),
            operations: Json(operations.iter().map(|op| op.name.clone()).collect()),
        };
        self.batch_store.insert_batch(&record).await?;

        for job in jobs {
            self.service.submit(job).await?;
        }

        Ok(batch_id)
    }

    /// Aggregate the batch status live from its member jobs. `None` for
    /// unknown batch ids.
    pub async fn get_batch_status(&self, batch_id: &str) -> Result<Option<BatchStatus>> {
        let Some(record) = self.batch_store.get_batch(batch_id).await? else {
            return Ok(None);
        };
        let jobs = self.job_store.jobs_by_ids(&record.job_ids.0).await?;
        Ok(Some(aggregate_batch(&record, &jobs)))
    }

    /// Batches whose derived status is not yet terminal.
    pub async fn get_active_batches(&self) -> Result<Vec<BatchStatus>> {
        let mut active = Vec::new();
        for record in self.batch_store.list_batches().await? {
            let jobs = self.job_store.jobs_by_ids(&record.job_ids.0).await?;
            let status = aggregate_batch(&record, &jobs);
            if !status.status.is_terminal() {
                active.push(status);
            }
        }
        Ok(active)
    }
}
