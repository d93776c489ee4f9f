//! Message envelope and response types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message in flight on the bus.
///
/// The payload is opaque JSON; subscribers validate it themselves.
/// `target` and `correlation_id` are carried verbatim for components that
/// address a specific peer or match responses to earlier requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub target: Option<String>,
    pub correlation_id: Option<String>,
    pub broadcast: bool,
}

impl Message {
    /// Create a message addressed to the first subscriber of `topic`.
    pub fn new(
        topic: impl Into<String>,
        payload: serde_json::Value,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            source: source.into(),
            timestamp: Utc::now(),
            target: None,
            correlation_id: None,
            broadcast: false,
        }
    }

    /// Address the message to a specific component.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Attach a correlation id for request/response matching.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Mark the message for fan-out to every subscriber.
    pub fn into_broadcast(mut self) -> Self {
        self.broadcast = true;
        self
    }
}

/// A handler's answer to a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl Response {
    /// A successful response with optional data.
    pub fn ok(data: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    /// A failed response carrying an error description.
    pub fn error(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Result of a send or broadcast.
///
/// `NoSubscribers` is the noop marker: nobody was listening, nothing ran.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Handled(Response),
    NoSubscribers,
}

impl SendOutcome {
    /// The handler response, if any subscriber was reached.
    pub fn response(&self) -> Option<&Response> {
        match self {
            SendOutcome::Handled(response) => Some(response),
            SendOutcome::NoSubscribers => None,
        }
    }

    /// Whether a handler ran and reported success.
    pub fn is_success(&self) -> bool {
        matches!(self, SendOutcome::Handled(r) if r.success)
    }

    /// Whether nobody was subscribed to the topic.
    pub fn is_noop(&self) -> bool {
        matches!(self, SendOutcome::NoSubscribers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_defaults() {
        let msg = Message::new("entity:created", json!({"id": 1}), "tests");
        assert_eq!(msg.topic, "entity:created");
        assert_eq!(msg.source, "tests");
        assert!(!msg.broadcast);
        assert!(msg.target.is_none());
        assert!(msg.correlation_id.is_none());
    }

    #[test]
    fn message_builders() {
        let msg = Message::new("entity:created", json!({}), "tests")
            .with_target("site-builder")
            .with_correlation_id("req-1")
            .into_broadcast();
        assert_eq!(msg.target.as_deref(), Some("site-builder"));
        assert_eq!(msg.correlation_id.as_deref(), Some("req-1"));
        assert!(msg.broadcast);
    }

    #[test]
    fn response_constructors() {
        let ok = Response::ok(Some(json!({"n": 2})));
        assert!(ok.success);
        assert!(ok.error.is_none());

        let err = Response::error("boom");
        assert!(!err.success);
        assert_eq!(err.error.as_deref(), Some("boom"));
        assert!(err.data.is_none());
    }

    #[test]
    fn outcome_helpers() {
        let handled = SendOutcome::Handled(Response::ok(None));
        assert!(handled.is_success());
        assert!(!handled.is_noop());
        assert!(handled.response().is_some());

        let noop = SendOutcome::NoSubscribers;
        assert!(noop.is_noop());
        assert!(!noop.is_success());
        assert!(noop.response().is_none());
    }
}
