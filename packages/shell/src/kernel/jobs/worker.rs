//! Job queue worker: a polling pool that claims due jobs and runs their
//! handlers.
//!
//! The worker never starts before the startup gate opens (the shell
//! starts it after the `system:plugins:ready` broadcast completes), so
//! jobs persisted from a prior run cannot execute before plugins are
//! ready.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::job::{ErrorKind, Job};
use super::progress::ProgressReporter;
use super::service::JobQueueService;

/// Configuration for the job queue worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Number of jobs processed concurrently.
    pub concurrency: usize,
    /// How long to sleep when no job is due.
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Classify a handler error for the retry decision.
///
/// Validation-shaped failures will not succeed on retry; everything else
/// (network errors, timeouts, busy resources) is worth retrying.
pub fn classify_error(error: &anyhow::Error) -> ErrorKind {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("not found")
        || error_str.contains("invalid")
        || error_str.contains("permission denied")
        || error_str.contains("unauthorized")
        || error_str.contains("forbidden")
        || error_str.contains("deserialize")
        || error_str.contains("parse")
    {
        return ErrorKind::NonRetryable;
    }

    ErrorKind::Retryable
}

/// Polling worker pool over the job queue service.
pub struct JobQueueWorker {
    service: Arc<JobQueueService>,
    config: WorkerConfig,
    running: Arc<AtomicBool>,
    shutdown: std::sync::Mutex<Option<CancellationToken>>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl JobQueueWorker {
    pub fn new(service: Arc<JobQueueService>, config: WorkerConfig) -> Self {
        Self {
            service,
            config,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: std::sync::Mutex::new(None),
            supervisor: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the polling loop. Idempotent: a second start while running
    /// is a no-op.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let token = CancellationToken::new();
        *self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(token.clone());

        info!(
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "job queue worker starting"
        );

        let service = Arc::clone(&self.service);
        let config = self.config.clone();
        let handle = tokio::spawn(async move {
            run_loop(service, config, token).await;
        });
        *self.supervisor.lock().await = Some(handle);
    }

    /// Stop gracefully: no new jobs are claimed and in-flight jobs run
    /// to completion. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(token) = self
            .shutdown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            token.cancel();
        }

        if let Some(handle) = self.supervisor.lock().await.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "worker supervisor task panicked");
            }
        }

        info!("job queue worker stopped");
    }
}

async fn run_loop(service: Arc<JobQueueService>, config: WorkerConfig, shutdown: CancellationToken) {
    let mut in_flight: JoinSet<()> = JoinSet::new();

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        // Reap finished slots.
        while in_flight.try_join_next().is_some() {}

        if in_flight.len() >= config.concurrency {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = in_flight.join_next() => {}
            }
            continue;
        }

        match service.claim_next().await {
            Ok(Some(job)) => {
                let service = Arc::clone(&service);
                in_flight.spawn(async move {
                    process_job(service, job).await;
                });
            }
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(config.poll_interval) => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to claim job");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }
    }

    // Graceful drain: in-flight jobs run to completion.
    let remaining = in_flight.len();
    if remaining > 0 {
        info!(count = remaining, "waiting for in-flight jobs to complete");
    }
    while in_flight.join_next().await.is_some() {}
}

async fn process_job(service: Arc<JobQueueService>, job: Job) {
    let job_id = job.id;
    let job_type = job.job_type.clone();
    debug!(job_id = %job_id, job_type = %job_type, "executing job");

    let Some(handler) = service.handler_for(&job_type) else {
        warn!(job_id = %job_id, job_type = %job_type, "no handler registered for job type");
        fail(
            &service,
            job_id,
            &format!("unknown job type: {}", job_type),
            ErrorKind::NonRetryable,
        )
        .await;
        return;
    };

    let Some(parsed) = handler.validate(&job.data) else {
        warn!(job_id = %job_id, job_type = %job_type, "job payload failed validation");
        fail(
            &service,
            job_id,
            &format!("invalid payload for job type: {}", job_type),
            ErrorKind::NonRetryable,
        )
        .await;
        return;
    };

    let reporter = ProgressReporter::new(job_id, job.batch_id.clone(), Arc::clone(service.monitor()));
    let result = handler.process(parsed, job_id, reporter.clone()).await;
    reporter.finish();

    match result {
        Ok(value) => {
            if let Err(e) = service.complete(job_id, value).await {
                error!(job_id = %job_id, error = %e, "failed to mark job as completed");
            }
        }
        Err(e) => {
            warn!(job_id = %job_id, job_type = %job_type, error = %e, "job failed");
            let kind = classify_error(&e);
            fail(&service, job_id, &e.to_string(), kind).await;
        }
    }
}

async fn fail(service: &JobQueueService, job_id: uuid::Uuid, error: &str, kind: ErrorKind) {
    if let Err(e) = service.fail(job_id, error, kind).await {
        error!(job_id = %job_id, error = %e, "failed to mark job as failed");
    }
}
