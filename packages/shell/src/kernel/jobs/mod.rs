//! Job infrastructure for durable background work.
//!
//! This module provides the kernel-level job queue engine:
//! - [`Job`] - the persistent job record
//! - [`SqliteJobStore`] - SQLite-backed storage for jobs and batches
//! - [`JobQueueService`] - enqueue/complete/fail, retry policy, handler
//!   registry (namespaced by plugin)
//! - [`JobQueueWorker`] - polling worker pool with graceful shutdown
//! - [`JobProgressMonitor`] - forwards lifecycle transitions onto the bus
//! - [`BatchJobManager`] - groups jobs under a batch id and aggregates
//!   their status live
//!
//! # Architecture
//!
//! ```text
//! Plugin calls service.enqueue(kind, data, options, plugin_id)
//!     │
//!     └─► Insert row (status = pending)
//!
//! JobQueueWorker
//!     │
//!     ├─► Claim next due pending job (priority desc, created_at asc)
//!     ├─► Look up handler by namespaced type
//!     ├─► handler.validate / handler.process
//!     └─► service.complete / service.fail (retry with backoff)
//! ```
//!
//! Handlers live in their plugins; this module only provides the
//! infrastructure.

mod batch;
mod handler;
mod job;
mod monitor;
mod progress;
mod service;
mod store;
mod worker;

pub use batch::{BatchJobManager, BatchOperation, BatchState, BatchStatus};
pub use handler::{JobHandler, TypedJobHandler};
pub use job::{namespaced_job_type, ErrorKind, Job, JobStatus};
pub use monitor::JobProgressMonitor;
pub use progress::ProgressReporter;
pub use service::{EnqueueOptions, JobQueueService, JobQueueStats};
pub use store::{BatchRecord, BatchStore, JobStore, SqliteJobStore};
pub use worker::{classify_error, JobQueueWorker, WorkerConfig};
