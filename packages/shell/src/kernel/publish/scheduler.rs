//! Cron-driven publish scheduler.
//!
//! One named cron timer per scheduled entity type plus one immediate
//! timer (`* * * * * *`) that drains entity types without a declared
//! schedule, one item per tick. Entries are popped before dispatch, so a
//! failing entry cannot re-enter the same tick; re-queueing after
//! failure is the caller's decision, informed by the retry tracker.
//!
//! Dispatch mode is decided at construction: message mode iff a bus is
//! supplied (the scheduler emits `publish:execute` and waits for
//! `publish:report:*` messages), provider mode otherwise (the scheduler
//! resolves content and calls the registered provider directly).

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use anyhow::{anyhow, Result};
use serde_json::json;
use switchboard::{MessageBus, Response, SubscriptionId};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{debug, info, warn};

use super::content::ContentResolver;
use super::provider::{ProviderRegistry, PublishResult};
use super::queue::{PublishQueueManager, QueueEntry};
use super::retry::{Clock, RetryConfig, RetryTracker};
use crate::kernel::topics;

const SOURCE: &str = "publish-scheduler";

/// The per-second schedule covering entity types without a declared cron.
const IMMEDIATE_SCHEDULE: &str = "* * * * * *";

/// Publish pipeline configuration.
#[derive(Debug, Clone)]
pub struct PublishConfig {
    /// entity type → cron expression (second-precision; five-field
    /// expressions get a `0` seconds field prepended). Types without an
    /// entry fall into the immediate schedule.
    pub entity_schedules: HashMap<String, String>,
    pub max_retries: u32,
    /// Base retry backoff; doubles each attempt.
    pub retry_base_delay_ms: i64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            entity_schedules: HashMap::new(),
            max_retries: 3,
            retry_base_delay_ms: 5_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid cron for {entity_type}: {reason}")]
    InvalidCron { entity_type: String, reason: String },
}

/// Synchronous observer for publish outcomes. Bus events remain the
/// canonical path; observers exist for in-process consumers that need
/// the result without a subscription.
pub trait PublishObserver: Send + Sync {
    fn on_published(&self, _entity_type: &str, _entity_id: &str, _result: &PublishResult) {}
    fn on_failed(
        &self,
        _entity_type: &str,
        _entity_id: &str,
        _error: &str,
        _retry_count: u32,
        _will_retry: bool,
    ) {
    }
}

struct SchedulerInner {
    queue: PublishQueueManager,
    providers: ProviderRegistry,
    retries: RetryTracker,
    resolver: Arc<dyn ContentResolver>,
    bus: Option<MessageBus>,
    observers: RwLock<Vec<Arc<dyn PublishObserver>>>,
    /// entity type → validated cron expression.
    schedules: Vec<(String, String)>,
    scheduled_types: HashSet<String>,
    running: AtomicBool,
    cron: Mutex<Option<JobScheduler>>,
    subscriptions: StdMutex<Vec<(&'static str, SubscriptionId)>>,
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        if let Some(bus) = &self.bus {
            let subscriptions = self
                .subscriptions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            for (topic, id) in subscriptions.iter() {
                bus.unsubscribe(topic, *id);
            }
        }
    }
}

/// Drains per-entity-type publish queues on cron cadences.
#[derive(Clone)]
pub struct PublishScheduler {
    inner: Arc<SchedulerInner>,
}

impl PublishScheduler {
    /// Build a scheduler. Every configured cron expression is validated
    /// here; an invalid one fails construction. Message mode is active
    /// iff `bus` is provided.
    pub fn new(
        config: PublishConfig,
        resolver: Arc<dyn ContentResolver>,
        bus: Option<MessageBus>,
    ) -> Result<Self, SchedulerError> {
        Self::with_clock(config, resolver, bus, Arc::new(super::retry::SystemClock))
    }

    /// As [`PublishScheduler::new`], with an injected clock for the
    /// retry tracker.
    pub fn with_clock(
        config: PublishConfig,
        resolver: Arc<dyn ContentResolver>,
        bus: Option<MessageBus>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SchedulerError> {
        let mut schedules = Vec::new();
        for (entity_type, expression) in &config.entity_schedules {
            schedules.push((entity_type.clone(), normalize_cron(entity_type, expression)?));
        }
        schedules.sort_by(|a, b| a.0.cmp(&b.0));
        let scheduled_types = schedules.iter().map(|(t, _)| t.clone()).collect();

        let queue = PublishQueueManager::new();
        for (entity_type, _) in &schedules {
            queue.register_type(entity_type);
        }

        let retries = RetryTracker::with_clock(
            RetryConfig {
                max_retries: config.max_retries,
                base_delay_ms: config.retry_base_delay_ms,
            },
            clock,
        );

        let inner = Arc::new(SchedulerInner {
            queue,
            providers: ProviderRegistry::new(),
            retries,
            resolver,
            bus: bus.clone(),
            observers: RwLock::new(Vec::new()),
            schedules,
            scheduled_types,
            running: AtomicBool::new(false),
            cron: Mutex::new(None),
            subscriptions: StdMutex::new(Vec::new()),
        });

        if let Some(bus) = &bus {
            wire_control_surface(&inner, bus);
        }

        Ok(Self { inner })
    }

    pub fn queue(&self) -> &PublishQueueManager {
        &self.inner.queue
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.inner.providers
    }

    pub fn retries(&self) -> &RetryTracker {
        &self.inner.retries
    }

    pub fn is_message_mode(&self) -> bool {
        self.inner.bus.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn add_observer(&self, observer: Arc<dyn PublishObserver>) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Queue an entity for its type's next tick; returns the 1-based
    /// position.
    pub fn queue_entity(&self, entity_type: &str, entity_id: &str) -> usize {
        self.inner.queue.add(entity_type, entity_id)
    }

    /// Start the cron timers. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match self.start_timers().await {
            Ok(scheduler) => {
                *self.inner.cron.lock().await = Some(scheduler);
                info!(
                    scheduled_types = self.inner.schedules.len(),
                    message_mode = self.is_message_mode(),
                    "publish scheduler started"
                );
                Ok(())
            }
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Stop all cron timers. In-flight dispatches run to completion.
    /// Idempotent.
    pub async fn stop(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(mut scheduler) = self.inner.cron.lock().await.take() {
            scheduler.shutdown().await?;
        }
        info!("publish scheduler stopped");
        Ok(())
    }

    /// Publish immediately, bypassing the queue and retry bookkeeping.
    /// The provider's result or error propagates to the caller.
    pub async fn publish_direct(
        &self,
        entity_type: &str,
        entity_id: &str,
        content: &str,
        metadata: &serde_json::Value,
    ) -> Result<PublishResult> {
        debug!(entity_type = %entity_type, entity_id = %entity_id, "direct publish");
        let provider = self.inner.providers.get(entity_type);
        provider.publish(content, metadata, None).await
    }

    async fn start_timers(&self) -> Result<JobScheduler> {
        let scheduler = JobScheduler::new().await?;

        for (entity_type, expression) in &self.inner.schedules {
            let inner = Arc::clone(&self.inner);
            let entity_type = entity_type.clone();
            let job = CronJob::new_async(expression.as_str(), move |_uuid, _lock| {
                let inner = inner.clone();
                let entity_type = entity_type.clone();
                Box::pin(async move {
                    inner.tick_type(&entity_type).await;
                })
            })?;
            scheduler.add(job).await?;
        }

        let inner = Arc::clone(&self.inner);
        let immediate = CronJob::new_async(IMMEDIATE_SCHEDULE, move |_uuid, _lock| {
            let inner = inner.clone();
            Box::pin(async move {
                inner.tick_immediate().await;
            })
        })?;
        scheduler.add(immediate).await?;

        scheduler.start().await?;
        Ok(scheduler)
    }
}

impl SchedulerInner {
    async fn tick_type(&self, entity_type: &str) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        if let Some(entry) = self.queue.pop_next(entity_type) {
            self.dispatch(entry).await;
        }
    }

    /// One item per tick across unscheduled types, so a busy type cannot
    /// monopolize the immediate schedule.
    async fn tick_immediate(&self) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        for entity_type in self.queue.queued_entity_types() {
            if self.scheduled_types.contains(&entity_type) {
                continue;
            }
            if let Some(entry) = self.queue.pop_next(&entity_type) {
                self.dispatch(entry).await;
                break;
            }
        }
    }

    async fn dispatch(&self, entry: QueueEntry) {
        debug!(
            entity_type = %entry.entity_type,
            entity_id = %entry.entity_id,
            "dispatching publish"
        );

        match &self.bus {
            Some(bus) => {
                let outcome = bus
                    .send(
                        topics::PUBLISH_EXECUTE,
                        json!({
                            "entityType": entry.entity_type,
                            "entityId": entry.entity_id,
                        }),
                        SOURCE,
                    )
                    .await;
                if outcome.is_noop() {
                    warn!(
                        entity_type = %entry.entity_type,
                        "no subscriber for publish:execute"
                    );
                }
            }
            None => self.dispatch_via_provider(entry).await,
        }
    }

    async fn dispatch_via_provider(&self, entry: QueueEntry) {
        let resolved = match self
            .resolver
            .resolve(&entry.entity_type, &entry.entity_id)
            .await
        {
            Ok(resolved) => resolved,
            Err(e) => {
                self.record_failure(
                    &entry.entity_type,
                    &entry.entity_id,
                    &format!("content resolution failed: {}", e),
                )
                .await;
                return;
            }
        };

        let provider = self.providers.get(&entry.entity_type);
        match provider
            .publish(
                &resolved.content,
                &resolved.metadata,
                resolved.image_data.as_deref(),
            )
            .await
        {
            Ok(result) => {
                self.record_success(&entry.entity_type, &entry.entity_id, &result)
                    .await
            }
            Err(e) => {
                self.record_failure(&entry.entity_type, &entry.entity_id, &e.to_string())
                    .await
            }
        }
    }

    async fn record_success(&self, entity_type: &str, entity_id: &str, result: &PublishResult) {
        self.retries.clear_retries(entity_id);
        info!(
            entity_type = %entity_type,
            entity_id = %entity_id,
            platform_id = %result.id,
            "publish succeeded"
        );

        for observer in self.observer_snapshot() {
            observer.on_published(entity_type, entity_id, result);
        }

        if let Some(bus) = &self.bus {
            bus.broadcast(
                topics::PUBLISH_COMPLETED,
                json!({
                    "entityType": entity_type,
                    "entityId": entity_id,
                    "result": result,
                }),
                SOURCE,
            )
            .await;
        }
    }

    async fn record_failure(&self, entity_type: &str, entity_id: &str, error: &str) {
        let info = self.retries.record_failure(entity_id, error);
        warn!(
            entity_type = %entity_type,
            entity_id = %entity_id,
            error = %error,
            retry_count = info.retry_count,
            will_retry = info.will_retry,
            "publish failed"
        );

        for observer in self.observer_snapshot() {
            observer.on_failed(entity_type, entity_id, error, info.retry_count, info.will_retry);
        }

        if let Some(bus) = &self.bus {
            bus.broadcast(
                topics::PUBLISH_FAILED,
                json!({
                    "entityType": entity_type,
                    "entityId": entity_id,
                    "error": error,
                    "retryCount": info.retry_count,
                    "willRetry": info.will_retry,
                }),
                SOURCE,
            )
            .await;
        }
    }

    fn observer_snapshot(&self) -> Vec<Arc<dyn PublishObserver>> {
        self.observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Validate a cron expression, prepending a seconds field to five-field
/// expressions so the classic format stays accepted.
fn normalize_cron(entity_type: &str, expression: &str) -> Result<String, SchedulerError> {
    let trimmed = expression.trim();
    let normalized = match trimmed.split_whitespace().count() {
        5 => format!("0 {}", trimmed),
        6 | 7 => trimmed.to_string(),
        n => {
            return Err(SchedulerError::InvalidCron {
                entity_type: entity_type.to_string(),
                reason: format!("expected 5-7 fields, got {}", n),
            })
        }
    };

    cron::Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
        entity_type: entity_type.to_string(),
        reason: e.to_string(),
    })?;

    Ok(normalized)
}

fn str_field<'a>(payload: &'a serde_json::Value, field: &str) -> Result<&'a str> {
    payload
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("missing field: {}", field))
}

/// Subscribe the pipeline's control topics on the bus (message mode).
fn wire_control_surface(inner: &Arc<SchedulerInner>, bus: &MessageBus) {
    let mut subscriptions = Vec::new();

    {
        let inner = Arc::downgrade(inner);
        let id = bus.subscribe(topics::PUBLISH_REGISTER, move |msg| {
            let inner = inner.clone();
            async move {
                let Some(inner) = inner.upgrade() else {
                    return Ok(Response::error("publish pipeline unavailable"));
                };
                let entity_type = str_field(&msg.payload, "entityType")?;
                inner.queue.register_type(entity_type);
                Ok(Response::ok(None))
            }
        });
        subscriptions.push((topics::PUBLISH_REGISTER, id));
    }

    {
        let inner = Arc::downgrade(inner);
        let events = bus.clone();
        let id = bus.subscribe(topics::PUBLISH_QUEUE, move |msg| {
            let inner = inner.clone();
            let events = events.clone();
            async move {
                let Some(inner) = inner.upgrade() else {
                    return Ok(Response::error("publish pipeline unavailable"));
                };
                let entity_type = str_field(&msg.payload, "entityType")?;
                let entity_id = str_field(&msg.payload, "entityId")?;
                let position = inner.queue.add(entity_type, entity_id);
                events
                    .broadcast(
                        topics::PUBLISH_QUEUED,
                        json!({
                            "entityType": entity_type,
                            "entityId": entity_id,
                            "position": position,
                        }),
                        SOURCE,
                    )
                    .await;
                Ok(Response::ok(Some(json!({ "position": position }))))
            }
        });
        subscriptions.push((topics::PUBLISH_QUEUE, id));
    }

    {
        let inner = Arc::downgrade(inner);
        let id = bus.subscribe(topics::PUBLISH_DIRECT, move |msg| {
            let inner = inner.clone();
            async move {
                let Some(inner) = inner.upgrade() else {
                    return Ok(Response::error("publish pipeline unavailable"));
                };
                let entity_type = str_field(&msg.payload, "entityType")?;
                let content = msg.payload.get("content").and_then(|v| v.as_str()).unwrap_or("");
                let metadata = msg
                    .payload
                    .get("metadata")
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                let provider = inner.providers.get(entity_type);
                let result = provider.publish(content, &metadata, None).await?;
                Ok(Response::ok(Some(serde_json::to_value(result)?)))
            }
        });
        subscriptions.push((topics::PUBLISH_DIRECT, id));
    }

    {
        let inner = Arc::downgrade(inner);
        let id = bus.subscribe(topics::PUBLISH_REMOVE, move |msg| {
            let inner = inner.clone();
            async move {
                let Some(inner) = inner.upgrade() else {
                    return Ok(Response::error("publish pipeline unavailable"));
                };
                let entity_type = str_field(&msg.payload, "entityType")?;
                let entity_id = str_field(&msg.payload, "entityId")?;
                let removed = inner.queue.remove(entity_type, entity_id);
                Ok(Response::ok(Some(json!({ "removed": removed }))))
            }
        });
        subscriptions.push((topics::PUBLISH_REMOVE, id));
    }

    {
        let inner = Arc::downgrade(inner);
        let id = bus.subscribe(topics::PUBLISH_REORDER, move |msg| {
            let inner = inner.clone();
            async move {
                let Some(inner) = inner.upgrade() else {
                    return Ok(Response::error("publish pipeline unavailable"));
                };
                let entity_type = str_field(&msg.payload, "entityType")?;
                let entity_id = str_field(&msg.payload, "entityId")?;
                let position = msg
                    .payload
                    .get("position")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| anyhow!("missing field: position"))?;
                let moved = inner
                    .queue
                    .reorder(entity_type, entity_id, position as usize);
                Ok(Response::ok(Some(json!({ "moved": moved }))))
            }
        });
        subscriptions.push((topics::PUBLISH_REORDER, id));
    }

    {
        let inner = Arc::downgrade(inner);
        let events = bus.clone();
        let id = bus.subscribe(topics::PUBLISH_LIST, move |msg| {
            let inner = inner.clone();
            let events = events.clone();
            async move {
                let Some(inner) = inner.upgrade() else {
                    return Ok(Response::error("publish pipeline unavailable"));
                };
                let entity_type = str_field(&msg.payload, "entityType")?;
                let queue: Vec<_> = inner
                    .queue
                    .list(entity_type)
                    .into_iter()
                    .map(|entry| {
                        json!({
                            "entityId": entry.entity_id,
                            "position": entry.position,
                            "queuedAt": entry.queued_at,
                        })
                    })
                    .collect();
                let payload = json!({ "entityType": entity_type, "queue": queue });
                events
                    .broadcast(topics::PUBLISH_LIST_RESPONSE, payload.clone(), SOURCE)
                    .await;
                Ok(Response::ok(Some(payload)))
            }
        });
        subscriptions.push((topics::PUBLISH_LIST, id));
    }

    {
        let inner = Arc::downgrade(inner);
        let id = bus.subscribe(topics::PUBLISH_REPORT_SUCCESS, move |msg| {
            let inner = inner.clone();
            async move {
                let Some(inner) = inner.upgrade() else {
                    return Ok(Response::error("publish pipeline unavailable"));
                };
                let entity_type = str_field(&msg.payload, "entityType")?.to_string();
                let entity_id = str_field(&msg.payload, "entityId")?.to_string();
                let result: PublishResult = msg
                    .payload
                    .get("result")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()?
                    .unwrap_or_else(|| PublishResult::new("unknown"));
                inner
                    .record_success(&entity_type, &entity_id, &result)
                    .await;
                Ok(Response::ok(None))
            }
        });
        subscriptions.push((topics::PUBLISH_REPORT_SUCCESS, id));
    }

    {
        let inner = Arc::downgrade(inner);
        let id = bus.subscribe(topics::PUBLISH_REPORT_FAILURE, move |msg| {
            let inner = inner.clone();
            async move {
                let Some(inner) = inner.upgrade() else {
                    return Ok(Response::error("publish pipeline unavailable"));
                };
                let entity_type = str_field(&msg.payload, "entityType")?.to_string();
                let entity_id = str_field(&msg.payload, "entityId")?.to_string();
                let error = str_field(&msg.payload, "error")?.to_string();
                inner.record_failure(&entity_type, &entity_id, &error).await;
                Ok(Response::ok(None))
            }
        });
        subscriptions.push((topics::PUBLISH_REPORT_FAILURE, id));
    }

    *inner
        .subscriptions
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = subscriptions;
}
