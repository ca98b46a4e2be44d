//! Topic-addressed publish/subscribe bus
//!
//! Carries real-time events between server instances. Every instance keeps one
//! bus handle; local components publish to a topic string (`channel:<id>`,
//! `channel:all`) and the bus delivers the payload to every instance that holds
//! an active subscription for that topic, including the publisher itself.
//!
//! # Architecture
//!
//! ```text
//! Instance A                      Redis                      Instance B
//!   publish("channel:42", ..) ──► PUBLISH channel:42 ──► on_message ─► messages()
//!                                       │
//!                                       └──────────────► on_message ─► messages()  (A, if subscribed)
//! ```
//!
//! Subscriptions are explicit: an instance only receives topics it has called
//! [`EventBus::subscribe`] for. Delivery is at-most-once and best-effort;
//! messages for a single topic keep their publish order.
//!
//! # Example
//!
//! ```no_run
//! use event_bus::{EventBus, RedisEventBus};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), event_bus::EventBusError> {
//!     let bus = RedisEventBus::connect("redis://localhost:6379", 1024).await?;
//!     let mut messages = bus.messages();
//!
//!     bus.subscribe("channel:42").await?;
//!     bus.publish("channel:42", r#"{"type":"PING"}"#.to_string()).await?;
//!
//!     let msg = messages.recv().await.expect("bus closed");
//!     assert_eq!(msg.topic, "channel:42");
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;

mod error;
mod memory;
mod redis_bus;

pub use error::EventBusError;
pub use memory::{InMemoryEventBus, InMemoryHub};
pub use redis_bus::RedisEventBus;

pub type Result<T> = std::result::Result<T, EventBusError>;

/// A payload delivered for a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Publish/subscribe medium keyed by topic string
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a payload to a topic
    ///
    /// Returns the number of bus subscribers that received it.
    async fn publish(&self, topic: &str, payload: String) -> Result<usize>;

    /// Start receiving messages for a topic on this instance
    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// Stop receiving messages for a topic on this instance
    async fn unsubscribe(&self, topic: &str) -> Result<()>;

    /// Stream of messages for every topic this instance is subscribed to
    fn messages(&self) -> broadcast::Receiver<BusMessage>;
}

/// Serialize `value` as JSON and publish it
pub async fn publish_json<T>(bus: &dyn EventBus, topic: &str, value: &T) -> Result<usize>
where
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_string(value)?;
    bus.publish(topic, payload).await
}
