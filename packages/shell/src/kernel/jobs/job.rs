//! Job model for durable background work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Whether the job can still change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a job failure, decides retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient error - will retry if attempts remain
    #[default]
    Retryable,
    /// Permanent error - will not retry
    NonRetryable,
}

impl ErrorKind {
    /// Whether this error kind should trigger a retry
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorKind::Retryable)
    }
}

/// Namespace a job kind with the registering plugin's id.
///
/// Kinds that already carry a namespace (contain `:`) pass through
/// unchanged, so plugins can address each other's job types.
pub fn namespaced_job_type(plugin_id: &str, kind: &str) -> String {
    if kind.contains(':') {
        kind.to_string()
    } else {
        format!("{}:{}", plugin_id, kind)
    }
}

/// A persistent job record.
///
/// Status transitions pending → running → (completed | failed). A
/// retryable failure with attempts left re-enters pending with
/// `scheduled_for` pushed out by exponential backoff.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,

    /// Namespaced type `<plugin_id>:<kind>`; handler lookup keys on the
    /// exact string.
    pub job_type: String,

    /// Opaque payload, validated by the handler before processing.
    pub data: serde_json::Value,

    pub status: JobStatus,

    /// Higher runs first among ready jobs.
    pub priority: i64,

    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub retry_count: i32,
    pub max_retries: i32,

    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,

    /// Caller context (`interfaceId`, `userId`, `operationType`, ...).
    pub metadata: serde_json::Value,

    /// Identifies the enqueuer.
    pub source: String,

    /// Set when the job belongs to a batch.
    pub batch_id: Option<String>,
}

impl Job {
    /// Whether the job is due and eligible for claiming.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_for <= now
    }

    /// Whether another retry attempt is allowed after a failure.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Job duration, if it has both started and finished.
    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some((completed - started).num_milliseconds()),
            _ => None,
        }
    }
}

/// Backoff delay before retry attempt `attempt` (1-based):
/// `base * 2^(attempt - 1)`.
pub(crate) fn backoff_delay_ms(base_delay_ms: i64, attempt: i32) -> i64 {
    let exponent = attempt.saturating_sub(1).min(30) as u32;
    base_delay_ms.saturating_mul(1i64 << exponent)
}
