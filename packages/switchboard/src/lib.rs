//! # Switchboard
//!
//! An in-process message bus that carries typed request/response and
//! broadcast traffic between loosely coupled components.
//!
//! ## Guarantees
//!
//! - **In-memory only**: Messages are not persisted
//! - **At-least-once within a send**: A delivered message reaches its
//!   handler exactly once per send; the bus itself never retries
//! - **Awaited broadcast**: `broadcast` does not resolve until every
//!   subscriber's handler has resolved
//! - **Serialized per subscription**: For any one subscription, handler
//!   invocations never overlap
//!
//! Handler failures are caught and reported to the caller as a failed
//! [`Response`]; they never take the bus down.
//!
//! ## Example
//!
//! ```ignore
//! use switchboard::{MessageBus, Response};
//! use serde_json::json;
//!
//! let bus = MessageBus::new();
//!
//! bus.subscribe("greeting:hello", |msg| async move {
//!     Ok(Response::ok(Some(json!({ "echo": msg.payload }))))
//! });
//!
//! let outcome = bus.send("greeting:hello", json!({ "name": "world" }), "example").await;
//! assert!(outcome.response().is_some());
//! ```

mod bus;
mod message;

pub use bus::{MessageBus, SubscriptionId};
pub use message::{Message, Response, SendOutcome};
