//! SQLite-backed storage for jobs and batches.
//!
//! The store is the single writer for job rows; workers and plugins go
//! through [`JobQueueService`](super::JobQueueService) methods rather
//! than touching rows directly.

use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, QueryBuilder, SqlitePool};
use uuid::Uuid;

use super::job::{Job, JobStatus};

const JOB_COLUMNS: &str = "id, job_type, data, status, priority, scheduled_for, created_at, \
     started_at, completed_at, retry_count, max_retries, last_error, result, metadata, source, batch_id";

/// Batch metadata row. Status is never stored; it is derived at read
/// time from the member jobs.
#[derive(FromRow, Debug, Clone)]
pub struct BatchRecord {
    pub batch_id: String,
    pub plugin_id: String,
    pub created_at: DateTime<Utc>,
    pub job_ids: Json<Vec<Uuid>>,
    /// Logical operation names, parallel to `job_ids`.
    pub operations: Json<Vec<String>>,
}

/// Storage operations for job rows.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    async fn insert(&self, job: &Job) -> Result<()>;

    /// Atomically claim the next due pending job: selected by
    /// `scheduled_for <= now`, ordered by `priority` descending then
    /// `created_at` ascending; marked running with `started_at = now`.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>>;

    async fn mark_completed(&self, job_id: Uuid, result: &serde_json::Value) -> Result<()>;

    /// Terminal failure.
    async fn mark_failed(&self, job_id: Uuid, error: &str) -> Result<()>;

    /// Re-queue a failed attempt: increments `retry_count`, resets the
    /// job to pending, and defers it until `run_at`.
    async fn schedule_retry(&self, job_id: Uuid, error: &str, run_at: DateTime<Utc>) -> Result<()>;

    async fn counts_by_status(&self) -> Result<Vec<(JobStatus, i64)>>;

    /// Pending and running jobs, optionally filtered by exact type.
    async fn active_jobs(&self, job_type: Option<&str>) -> Result<Vec<Job>>;

    async fn jobs_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Job>>;
}

/// Storage operations for batch metadata.
#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn insert_batch(&self, record: &BatchRecord) -> Result<()>;

    async fn get_batch(&self, batch_id: &str) -> Result<Option<BatchRecord>>;

    async fn list_batches(&self) -> Result<Vec<BatchRecord>>;
}

/// SQLite-backed implementation of [`JobStore`] and [`BatchStore`].
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open a store at the given SQLite URL, creating the file and the
    /// schema if missing.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("invalid sqlite url: {}", url))?
            .create_if_missing(true);

        // A shared in-memory database exists per connection; keep the
        // pool at one connection so every query sees the same data.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("failed to open sqlite job store")?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// An in-memory store for tests.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id BLOB PRIMARY KEY,
                job_type TEXT NOT NULL,
                data TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                priority INTEGER NOT NULL DEFAULT 0,
                scheduled_for TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                last_error TEXT,
                result TEXT,
                metadata TEXT NOT NULL,
                source TEXT NOT NULL,
                batch_id TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_status_scheduled ON jobs (status, scheduled_for)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_batch ON jobs (batch_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS batches (
                batch_id TEXT PRIMARY KEY,
                plugin_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                job_ids TEXT NOT NULL,
                operations TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: &Job) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, data, status, priority, scheduled_for, created_at,
                              started_at, completed_at, retry_count, max_retries, last_error,
                              result, metadata, source, batch_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job.id)
        .bind(&job.job_type)
        .bind(&job.data)
        .bind(job.status)
        .bind(job.priority)
        .bind(job.scheduled_for)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.retry_count)
        .bind(job.max_retries)
        .bind(&job.last_error)
        .bind(&job.result)
        .bind(&job.metadata)
        .bind(&job.source)
        .bind(&job.batch_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE jobs
            SET status = 'running', started_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'pending' AND scheduled_for <= ?
                ORDER BY priority DESC, created_at ASC
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn mark_completed(&self, job_id: Uuid, result: &serde_json::Value) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'completed', completed_at = ?, result = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(result)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_failed(&self, job_id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'failed', completed_at = ?, last_error = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(error)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn schedule_retry(&self, job_id: Uuid, error: &str, run_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                retry_count = retry_count + 1,
                scheduled_for = ?,
                last_error = ?,
                started_at = NULL
            WHERE id = ?
            "#,
        )
        .bind(run_at)
        .bind(error)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn counts_by_status(&self) -> Result<Vec<(JobStatus, i64)>> {
        let counts = sqlx::query_as::<_, (JobStatus, i64)>(
            "SELECT status, COUNT(*) FROM jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(counts)
    }

    async fn active_jobs(&self, job_type: Option<&str>) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status IN ('pending', 'running')
              AND (? IS NULL OR job_type = ?)
            ORDER BY created_at ASC
            "#
        ))
        .bind(job_type)
        .bind(job_type)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn jobs_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Job>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder =
            QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id IN ("));
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        builder.push(")");

        let jobs = builder.build_query_as::<Job>().fetch_all(&self.pool).await?;
        Ok(jobs)
    }
}

#[async_trait]
impl BatchStore for SqliteJobStore {
    async fn insert_batch(&self, record: &BatchRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO batches (batch_id, plugin_id, created_at, job_ids, operations)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.batch_id)
        .bind(&record.plugin_id)
        .bind(record.created_at)
        .bind(&record.job_ids)
        .bind(&record.operations)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_batch(&self, batch_id: &str) -> Result<Option<BatchRecord>> {
        let record = sqlx::query_as::<_, BatchRecord>(
            "SELECT batch_id, plugin_id, created_at, job_ids, operations FROM batches WHERE batch_id = ?",
        )
        .bind(batch_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list_batches(&self) -> Result<Vec<BatchRecord>> {
        let records = sqlx::query_as::<_, BatchRecord>(
            "SELECT batch_id, plugin_id, created_at, job_ids, operations FROM batches ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job_with(job_type: &str, priority: i64, scheduled_for: DateTime<Utc>) -> Job {
        Job {
            id: Uuid::new_v4(),
            job_type: job_type.to_string(),
            data: json!({"n": 1}),
            status: JobStatus::Pending,
            priority,
            scheduled_for,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: 3,
            last_error: None,
            result: None,
            metadata: json!({}),
            source: "tests".to_string(),
            batch_id: None,
        }
    }

    #[tokio::test]
    async fn insert_and_get_roundtrip() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let job = job_with("notes:embed", 0, Utc::now());
        store.insert(&job).await.unwrap();

        let loaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.job_type, "notes:embed");
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(loaded.data, json!({"n": 1}));
    }

    #[tokio::test]
    async fn claim_prefers_higher_priority() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let now = Utc::now();
        let low = job_with("notes:low", 1, now - chrono::Duration::seconds(5));
        let high = job_with("notes:high", 10, now - chrono::Duration::seconds(5));
        store.insert(&low).await.unwrap();
        store.insert(&high).await.unwrap();

        let claimed = store.claim_next(now).await.unwrap().unwrap();
        assert_eq!(claimed.id, high.id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.started_at.is_some());

        let next = store.claim_next(now).await.unwrap().unwrap();
        assert_eq!(next.id, low.id);

        assert!(store.claim_next(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_breaks_priority_ties_by_age() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let now = Utc::now();
        let mut older = job_with("notes:a", 0, now - chrono::Duration::seconds(5));
        older.created_at = now - chrono::Duration::seconds(60);
        let newer = job_with("notes:b", 0, now - chrono::Duration::seconds(5));
        store.insert(&newer).await.unwrap();
        store.insert(&older).await.unwrap();

        let claimed = store.claim_next(now).await.unwrap().unwrap();
        assert_eq!(claimed.id, older.id);
    }

    #[tokio::test]
    async fn future_jobs_are_not_claimed() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let now = Utc::now();
        let job = job_with("notes:later", 0, now + chrono::Duration::seconds(60));
        store.insert(&job).await.unwrap();

        assert!(store.claim_next(now).await.unwrap().is_none());

        let later = now + chrono::Duration::seconds(120);
        assert!(store.claim_next(later).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn completion_and_failure_update_rows() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let a = job_with("notes:a", 0, Utc::now());
        let b = job_with("notes:b", 0, Utc::now());
        store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();

        store.mark_completed(a.id, &json!({"done": true})).await.unwrap();
        store.mark_failed(b.id, "boom").await.unwrap();

        let a = store.get(a.id).await.unwrap().unwrap();
        assert_eq!(a.status, JobStatus::Completed);
        assert_eq!(a.result, Some(json!({"done": true})));
        assert!(a.completed_at.is_some());

        let b = store.get(b.id).await.unwrap().unwrap();
        assert_eq!(b.status, JobStatus::Failed);
        assert_eq!(b.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn schedule_retry_requeues_with_backoff() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let now = Utc::now();
        let job = job_with("notes:retry", 0, now);
        store.insert(&job).await.unwrap();
        store.claim_next(now).await.unwrap().unwrap();

        let run_at = now + chrono::Duration::seconds(10);
        store.schedule_retry(job.id, "flaky", run_at).await.unwrap();

        let loaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(loaded.retry_count, 1);
        assert_eq!(loaded.last_error.as_deref(), Some("flaky"));
        assert!(loaded.started_at.is_none());

        // Not claimable until the backoff elapses.
        assert!(store.claim_next(now).await.unwrap().is_none());
        assert!(store
            .claim_next(run_at + chrono::Duration::seconds(1))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn counts_and_active_jobs() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let now = Utc::now();
        let a = job_with("notes:a", 0, now);
        let b = job_with("notes:b", 0, now);
        let c = job_with("notes:a", 0, now);
        store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();
        store.insert(&c).await.unwrap();
        store.claim_next(now).await.unwrap();
        store.mark_completed(a.id, &json!(null)).await.unwrap();

        let counts: std::collections::HashMap<_, _> =
            store.counts_by_status().await.unwrap().into_iter().collect();
        assert_eq!(counts.get(&JobStatus::Completed), Some(&1));
        assert_eq!(counts.get(&JobStatus::Pending), Some(&2));

        let active = store.active_jobs(None).await.unwrap();
        assert_eq!(active.len(), 2);

        let typed = store.active_jobs(Some("notes:a")).await.unwrap();
        assert_eq!(typed.len(), 1);
        assert_eq!(typed[0].id, c.id);
    }

    #[tokio::test]
    async fn jobs_by_ids_fetches_exactly_requested() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let a = job_with("notes:a", 0, Utc::now());
        let b = job_with("notes:b", 0, Utc::now());
        store.insert(&a).await.unwrap();
        store.insert(&b).await.unwrap();

        let jobs = store.jobs_by_ids(&[a.id]).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, a.id);

        assert!(store.jobs_by_ids(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_records_roundtrip() {
        let store = SqliteJobStore::in_memory().await.unwrap();
        let record = BatchRecord {
            batch_id: "batch-1".to_string(),
            plugin_id: "notes".to_string(),
            created_at: Utc::now(),
            job_ids: Json(vec![Uuid::new_v4(), Uuid::new_v4()]),
            operations: Json(vec!["embed".to_string(), "index".to_string()]),
        };
        store.insert_batch(&record).await.unwrap();

        let loaded = store.get_batch("batch-1").await.unwrap().unwrap();
        assert_eq!(loaded.plugin_id, "notes");
        assert_eq!(loaded.job_ids.0.len(), 2);
        assert_eq!(loaded.operations.0, vec!["embed", "index"]);

        assert!(store.get_batch("missing").await.unwrap().is_none());
        assert_eq!(store.list_batches().await.unwrap().len(), 1);
    }
}
