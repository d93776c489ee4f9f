//! Handler-facing progress reporting.
//!
//! Handlers receive a [`ProgressReporter`] and call
//! `report(current, total, message)`; reports flow through the
//! [`JobProgressMonitor`](super::JobProgressMonitor) onto the bus as
//! `job:progress` events (and `batch:progress` for batch members).
//! Sub-reporters prefix their messages with a label path; heartbeats
//! re-emit the last report periodically so observers can tell a
//! long-running job from a stuck one.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::monitor::JobProgressMonitor;

#[derive(Debug, Clone)]
struct LastReport {
    current: u64,
    total: u64,
    message: Option<String>,
}

/// Progress reporter handed to job handlers.
///
/// Cloning is cheap; clones share the lifecycle token, so
/// [`ProgressReporter::finish`] (called by the worker) stops every
/// heartbeat spawned from this job, sub-reporters included.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: Uuid,
    batch_id: Option<String>,
    labels: Vec<String>,
    monitor: Arc<JobProgressMonitor>,
    last: Arc<Mutex<Option<LastReport>>>,
    /// Cancelled when the job finishes; parents every heartbeat token.
    lifecycle: CancellationToken,
    heartbeat: Arc<Mutex<Option<CancellationToken>>>,
}

impl ProgressReporter {
    pub fn new(job_id: Uuid, batch_id: Option<String>, monitor: Arc<JobProgressMonitor>) -> Self {
        Self {
            job_id,
            batch_id,
            labels: Vec::new(),
            monitor,
            last: Arc::new(Mutex::new(None)),
            lifecycle: CancellationToken::new(),
            heartbeat: Arc::new(Mutex::new(None)),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Emit a progress update.
    pub async fn report(&self, current: u64, total: u64, message: Option<&str>) {
        let message = self.labeled(message);
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(LastReport {
            current,
            total,
            message: message.clone(),
        });
        self.monitor
            .job_progress(
                self.job_id,
                self.batch_id.as_deref(),
                current,
                total,
                message.as_deref(),
            )
            .await;
    }

    /// Create a sub-reporter for a nested unit of work. Its messages are
    /// prefixed with the label path; its heartbeat is independent but
    /// still dies with the job.
    pub fn create_sub(&self, label: impl Into<String>) -> Self {
        let mut labels = self.labels.clone();
        labels.push(label.into());
        Self {
            job_id: self.job_id,
            batch_id: self.batch_id.clone(),
            labels,
            monitor: Arc::clone(&self.monitor),
            last: Arc::new(Mutex::new(None)),
            lifecycle: self.lifecycle.clone(),
            heartbeat: Arc::new(Mutex::new(None)),
        }
    }

    /// Start re-emitting the last report every `interval`. Replaces a
    /// previous heartbeat on this reporter.
    pub fn start_heartbeat(&self, interval: Duration) {
        let token = self.lifecycle.child_token();
        if let Some(previous) = self
            .heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(token.clone())
        {
            previous.cancel();
        }

        let reporter = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // skip the immediate tick
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let last = reporter
                            .last
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .clone();
                        if let Some(last) = last {
                            reporter
                                .monitor
                                .job_progress(
                                    reporter.job_id,
                                    reporter.batch_id.as_deref(),
                                    last.current,
                                    last.total,
                                    last.message.as_deref(),
                                )
                                .await;
                        }
                    }
                }
            }
        });
    }

    /// Stop this reporter's heartbeat. Idempotent.
    pub fn stop_heartbeat(&self) {
        if let Some(token) = self
            .heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            token.cancel();
        }
    }

    /// Called by the worker when the job finishes: stops every heartbeat
    /// spawned for this job, including those of sub-reporters.
    pub(crate) fn finish(&self) {
        self.lifecycle.cancel();
    }

    fn labeled(&self, message: Option<&str>) -> Option<String> {
        if self.labels.is_empty() {
            return message.map(String::from);
        }
        let prefix = self.labels.join(" / ");
        Some(match message {
            Some(message) => format!("{}: {}", prefix, message),
            None => prefix,
        })
    }
}
