//! Publish pipeline: per-entity-type ordered queues drained on cron
//! cadences, with provider-mode or message-mode dispatch.
//!
//! # Architecture
//!
//! ```text
//! PublishScheduler
//!     │
//!     ├─► one cron timer per scheduled entity type
//!     ├─► one immediate timer (* * * * * *) for unscheduled types
//!     │
//!     └─► tick: pop next queued entry for the type
//!             ├─► provider mode: resolve content → provider.publish(...)
//!             └─► message mode:  emit publish:execute on the bus
//! ```
//!
//! The scheduler reports outcomes (bus events plus observers) and records
//! retry state; it never re-queues a failed entry itself. The caller that
//! queued the entity decides whether to re-queue, gated by
//! [`RetryTracker::is_ready_for_retry`].

mod content;
mod provider;
mod queue;
mod retry;
mod scheduler;

pub use content::{ContentResolver, EmptyContentResolver, ResolvedContent};
pub use provider::{InternalProvider, ProviderRegistry, PublishProvider, PublishResult};
pub use queue::{PublishQueueManager, QueueEntry};
pub use retry::{Clock, ManualClock, RetryConfig, RetryInfo, RetryTracker, SystemClock};
pub use scheduler::{PublishConfig, PublishObserver, PublishScheduler, SchedulerError};
