//! Work-coordination core for the memoria knowledge shell.
//!
//! This crate provides the kernel-level infrastructure that plugins build
//! on:
//! - A durable, SQLite-backed job queue with a polling worker pool,
//!   retries with exponential backoff, and progress reporting
//! - A batch manager that groups jobs and aggregates their status live
//! - A publish pipeline: per-entity-type ordered queues drained on cron
//!   cadences and dispatched through registered providers or as bus
//!   messages
//! - A service registry and the plugin/startup orchestration that gates
//!   background work behind the `system:plugins:ready` broadcast
//!
//! Typed messaging between components rides on the [`switchboard`] bus.
//!
//! # Architecture
//!
//! ```text
//! Shell::initialize()
//!     │
//!     ├─► Plugin.register(ctx)           (sync, in registration order)
//!     ├─► core services into registry
//!     ├─► broadcast system:plugins:ready (awaits every handler)
//!     └─► start JobQueueWorker + enable JobProgressMonitor
//!
//! JobQueueWorker
//!     │
//!     ├─► Poll store (claim next pending job)
//!     ├─► Look up handler, validate payload
//!     ├─► Handler.process(data, job_id, progress)
//!     └─► complete / fail (service applies retry policy)
//!
//! PublishScheduler
//!     │
//!     ├─► One cron timer per scheduled entity type
//!     ├─► One immediate timer for unscheduled types
//!     └─► pop entry → provider.publish(...)  or  publish:execute message
//! ```

pub mod config;
pub mod kernel;


pub use config::ShellConfig;
pub use kernel::Shell;
