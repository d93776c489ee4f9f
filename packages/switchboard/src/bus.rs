//! Topic-keyed message bus with request/response and broadcast delivery.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::debug;

use crate::message::{Message, Response, SendOutcome};

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Response>> + Send>>;
type BoxedHandler = Box<dyn Fn(Message) -> HandlerFuture + Send + Sync>;

/// Identifies one subscription on one topic. Returned by
/// [`MessageBus::subscribe`] and consumed by [`MessageBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    handler: Arc<BoxedHandler>,
    /// Serializes handler invocations for this subscription.
    serial: Arc<Mutex<()>>,
}

impl Clone for Subscription {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            handler: Arc::clone(&self.handler),
            serial: Arc::clone(&self.serial),
        }
    }
}

struct BusInner {
    topics: RwLock<HashMap<String, Vec<Subscription>>>,
    next_id: AtomicU64,
}

/// In-process message bus.
///
/// Cloning is cheap and all clones share the same subscription table.
/// Non-broadcast sends deliver to the first subscriber in subscription
/// order; broadcasts fan out to every subscriber concurrently and resolve
/// once all handlers have resolved.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe an async handler to a topic.
    ///
    /// Multiple subscribers per topic are permitted; subscription order is
    /// retained and decides who answers non-broadcast sends.
    pub fn subscribe<F, Fut>(&self, topic: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let boxed: BoxedHandler = Box::new(move |msg| Box::pin(handler(msg)));
        let subscription = Subscription {
            id,
            handler: Arc::new(boxed),
            serial: Arc::new(Mutex::new(())),
        };

        let mut topics = self
            .inner
            .topics
            .write()
            .unwrap_or_else(|e| e.into_inner());
        topics.entry(topic.into()).or_default().push(subscription);
        id
    }

    /// Remove a subscription. A no-op for ids that are unknown or were
    /// already removed.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) {
        let mut topics = self
            .inner
            .topics
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Number of active subscriptions for a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .map_or(0, |s| s.len())
    }

    /// Send a message to the first subscriber of `topic` and await its
    /// response. Handler errors are caught and returned as a failed
    /// [`Response`]; a topic with no subscribers yields
    /// [`SendOutcome::NoSubscribers`].
    pub async fn send(
        &self,
        topic: &str,
        payload: serde_json::Value,
        source: &str,
    ) -> SendOutcome {
        self.send_message(Message::new(topic, payload, source)).await
    }

    /// Send a pre-built message (non-broadcast) to its topic's first
    /// subscriber.
    pub async fn send_message(&self, message: Message) -> SendOutcome {
        let first = {
            let topics = self
                .inner
                .topics
                .read()
                .unwrap_or_else(|e| e.into_inner());
            topics.get(&message.topic).and_then(|s| s.first().cloned())
        };

        let Some(subscription) = first else {
            debug!(topic = %message.topic, "no subscribers for message");
            return SendOutcome::NoSubscribers;
        };

        SendOutcome::Handled(Self::invoke(&subscription, message).await)
    }

    /// Deliver a message to every subscriber of `topic` concurrently and
    /// await all of them. Failures are aggregated into a single failed
    /// response; the outcome is successful only when every handler
    /// succeeded.
    pub async fn broadcast(
        &self,
        topic: &str,
        payload: serde_json::Value,
        source: &str,
    ) -> SendOutcome {
        let message = Message::new(topic, payload, source).into_broadcast();
        let subscribers: Vec<Subscription> = {
            let topics = self
                .inner
                .topics
                .read()
                .unwrap_or_else(|e| e.into_inner());
            topics.get(topic).cloned().unwrap_or_default()
        };

        if subscribers.is_empty() {
            debug!(topic = %topic, "no subscribers for broadcast");
            return SendOutcome::NoSubscribers;
        }

        let total = subscribers.len();
        let deliveries = subscribers.into_iter().map(|subscription| {
            let message = message.clone();
            async move { Self::invoke(&subscription, message).await }
        });
        let responses = futures::future::join_all(deliveries).await;

        let errors: Vec<String> = responses
            .into_iter()
            .filter(|r| !r.success)
            .map(|r| r.error.unwrap_or_else(|| "unknown error".to_string()))
            .collect();

        if errors.is_empty() {
            SendOutcome::Handled(Response::ok(None))
        } else {
            SendOutcome::Handled(Response::error(format!(
                "{} of {} handlers failed: {}",
                errors.len(),
                total,
                errors.join("; ")
            )))
        }
    }

    async fn invoke(subscription: &Subscription, message: Message) -> Response {
        let _serial = subscription.serial.lock().await;
        match (*subscription.handler)(message).await {
            Ok(response) => response,
            Err(e) => Response::error(e.to_string()),
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = self
            .inner
            .topics
            .read()
            .unwrap_or_else(|e| e.into_inner());
        f.debug_struct("MessageBus")
            .field("topic_count", &topics.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn send_reaches_first_subscriber() {
        let bus = MessageBus::new();
        bus.subscribe("math:double", |msg| async move {
            let n = msg.payload["n"].as_i64().unwrap_or(0);
            Ok(Response::ok(Some(json!({ "n": n * 2 }))))
        });

        let outcome = bus.send("math:double", json!({ "n": 21 }), "tests").await;
        let response = outcome.response().unwrap();
        assert!(response.success);
        assert_eq!(response.data.as_ref().unwrap()["n"], 42);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let bus = MessageBus::new();
        let outcome = bus.send("nobody:home", json!({}), "tests").await;
        assert!(outcome.is_noop());
    }

    #[tokio::test]
    async fn send_picks_first_in_subscription_order() {
        let bus = MessageBus::new();
        bus.subscribe("pick:one", |_| async { Ok(Response::ok(Some(json!("first")))) });
        bus.subscribe("pick:one", |_| async { Ok(Response::ok(Some(json!("second")))) });

        let outcome = bus.send("pick:one", json!({}), "tests").await;
        assert_eq!(outcome.response().unwrap().data, Some(json!("first")));
    }

    #[tokio::test]
    async fn handler_error_is_caught() {
        let bus = MessageBus::new();
        bus.subscribe("boom:now", |_| async { Err(anyhow::anyhow!("handler exploded")) });

        let outcome = bus.send("boom:now", json!({}), "tests").await;
        let response = outcome.response().unwrap();
        assert!(!response.success);
        assert!(response.error.as_deref().unwrap().contains("exploded"));
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber() {
        let bus = MessageBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = counter.clone();
            bus.subscribe("fanout:event", move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Response::ok(None))
                }
            });
        }

        let outcome = bus.broadcast("fanout:event", json!({}), "tests").await;
        assert!(outcome.is_success());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn broadcast_awaits_all_handlers() {
        let bus = MessageBus::new();
        let done = Arc::new(AtomicUsize::new(0));
        for delay_ms in [5u64, 30] {
            let done = done.clone();
            bus.subscribe("slow:event", move |_| {
                let done = done.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(Response::ok(None))
                }
            });
        }

        bus.broadcast("slow:event", json!({}), "tests").await;
        // Both handlers must have resolved before broadcast returned.
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn broadcast_aggregates_failures() {
        let bus = MessageBus::new();
        bus.subscribe("mixed:event", |_| async { Ok(Response::ok(None)) });
        bus.subscribe("mixed:event", |_| async { Err(anyhow::anyhow!("one bad apple")) });

        let outcome = bus.broadcast("mixed:event", json!({}), "tests").await;
        let response = outcome.response().unwrap();
        assert!(!response.success);
        let error = response.error.as_deref().unwrap();
        assert!(error.contains("1 of 2 handlers failed"));
        assert!(error.contains("one bad apple"));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus = MessageBus::new();
        let id = bus.subscribe("leave:me", |_| async { Ok(Response::ok(None)) });
        assert_eq!(bus.subscriber_count("leave:me"), 1);

        bus.unsubscribe("leave:me", id);
        assert_eq!(bus.subscriber_count("leave:me"), 0);

        // Second removal of the same id is a no-op.
        bus.unsubscribe("leave:me", id);
        assert_eq!(bus.subscriber_count("leave:me"), 0);

        let outcome = bus.send("leave:me", json!({}), "tests").await;
        assert!(outcome.is_noop());
    }

    #[tokio::test]
    async fn unsubscribe_promotes_next_subscriber() {
        let bus = MessageBus::new();
        let first = bus.subscribe("order:topic", |_| async { Ok(Response::ok(Some(json!(1)))) });
        bus.subscribe("order:topic", |_| async { Ok(Response::ok(Some(json!(2)))) });

        bus.unsubscribe("order:topic", first);
        let outcome = bus.send("order:topic", json!({}), "tests").await;
        assert_eq!(outcome.response().unwrap().data, Some(json!(2)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn handler_invocations_are_serialized_per_subscription() {
        let bus = MessageBus::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicUsize::new(0));

        let in_flight_h = in_flight.clone();
        let overlapped_h = overlapped.clone();
        bus.subscribe("serial:topic", move |_| {
            let in_flight = in_flight_h.clone();
            let overlapped = overlapped_h.clone();
            async move {
                if in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlapped.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(Response::ok(None))
            }
        });

        let sends = (0..8).map(|_| bus.send("serial:topic", json!({}), "tests"));
        futures::future::join_all(sends).await;
        assert_eq!(overlapped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn clone_shares_subscriptions() {
        let bus = MessageBus::new();
        let bus2 = bus.clone();
        bus.subscribe("shared:topic", |_| async { Ok(Response::ok(None)) });

        let outcome = bus2.send("shared:topic", json!({}), "tests").await;
        assert!(outcome.is_success());
    }
}
