//! Per-entity retry tracking with exponential backoff.
//!
//! Keyed by entity id: the scheduler treats an entity as the unit of
//! retry, regardless of how many jobs or dispatches it took. The tracker
//! informs re-queue decisions; it never re-queues anything itself.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// Wall-clock source, injected so backoff math is testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone)]
struct RetryState {
    retry_count: u32,
    last_error: String,
    next_retry_at: DateTime<Utc>,
}

/// Snapshot of an entity's retry state.
#[derive(Debug, Clone, Serialize)]
pub struct RetryInfo {
    pub retry_count: u32,
    pub last_error: String,
    pub next_retry_at: DateTime<Utc>,
    /// `retry_count < max_retries`.
    pub will_retry: bool,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    /// Base backoff delay; doubles each failure.
    pub base_delay_ms: i64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 5_000,
        }
    }
}

pub struct RetryTracker {
    entries: DashMap<String, RetryState>,
    config: RetryConfig,
    clock: Arc<dyn Clock>,
}

impl RetryTracker {
    pub fn new(config: RetryConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            clock,
        }
    }

    /// Record a failure: bumps the counter and pushes `next_retry_at`
    /// out by `base * 2^(count - 1)`.
    pub fn record_failure(&self, entity_id: &str, error: &str) -> RetryInfo {
        let now = self.clock.now();
        let mut entry = self
            .entries
            .entry(entity_id.to_string())
            .or_insert_with(|| RetryState {
                retry_count: 0,
                last_error: String::new(),
                next_retry_at: now,
            });

        entry.retry_count += 1;
        entry.last_error = error.to_string();
        let exponent = (entry.retry_count - 1).min(30);
        let delay_ms = self.config.base_delay_ms.saturating_mul(1i64 << exponent);
        entry.next_retry_at = now + chrono::Duration::milliseconds(delay_ms);

        self.snapshot(&entry)
    }

    /// Whether another attempt is allowed for this entity.
    pub fn should_retry(&self, entity_id: &str) -> bool {
        self.entries
            .get(entity_id)
            .map(|entry| entry.retry_count < self.config.max_retries)
            // No recorded failures yet: nothing forbids an attempt.
            .unwrap_or(true)
    }

    /// Whether the backoff window has elapsed.
    pub fn is_ready_for_retry(&self, entity_id: &str) -> bool {
        self.entries
            .get(entity_id)
            .map(|entry| self.clock.now() >= entry.next_retry_at)
            .unwrap_or(true)
    }

    /// Forget an entity's failures (on success report or explicit clear).
    pub fn clear_retries(&self, entity_id: &str) {
        self.entries.remove(entity_id);
    }

    pub fn get_retry_info(&self, entity_id: &str) -> Option<RetryInfo> {
        self.entries.get(entity_id).map(|entry| self.snapshot(&entry))
    }

    fn snapshot(&self, state: &RetryState) -> RetryInfo {
        RetryInfo {
            retry_count: state.retry_count,
            last_error: state.last_error.clone(),
            next_retry_at: state.next_retry_at,
            will_retry: state.retry_count < self.config.max_retries,
        }
    }
}
