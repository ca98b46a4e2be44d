use dashmap::DashMap;
use event_bus::{BusMessage, EventBus, EventBusError};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{
    mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    Mutex, RwLock,
};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::models::{ChannelId, ScenarioId, Topic};
use crate::repository::{ChannelDirectory, DirectoryError};

pub mod message_types;

/// Unique identifier for a WebSocket subscriber
///
/// Each WebSocket connection gets a unique subscriber ID when it registers.
/// This allows for precise cleanup when connections close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown scenario: {0}")]
    UnknownScenario(ScenarioId),

    #[error("channelId or scenarioId is required")]
    MissingIdentifier,

    #[error("channel id {0} is reserved")]
    ReservedChannel(ChannelId),

    #[error("topic lookup failed: {0}")]
    Lookup(#[from] DirectoryError),

    #[error("event bus error: {0}")]
    Bus(#[from] EventBusError),
}

/// How a connection names the channel it wants
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicDescriptor {
    Channel(ChannelId),
    /// Resolved to the owning channel once, at registration
    Scenario(ScenarioId),
}

impl TopicDescriptor {
    /// Channel wins when both are given; blanks count as absent
    pub fn from_parts(
        channel_id: Option<&str>,
        scenario_id: Option<&str>,
    ) -> Result<Self, RegistryError> {
        fn present(v: Option<&str>) -> Option<&str> {
            v.map(str::trim).filter(|v| !v.is_empty())
        }

        if let Some(id) = present(channel_id) {
            return Ok(TopicDescriptor::Channel(ChannelId::new(id)));
        }
        if let Some(id) = present(scenario_id) {
            return Ok(TopicDescriptor::Scenario(ScenarioId::new(id)));
        }
        Err(RegistryError::MissingIdentifier)
    }
}

/// Subscriber entry with ID and channel
struct Subscriber {
    id: SubscriberId,
    sender: UnboundedSender<String>,
}

#[derive(Default)]
struct TopicSubscription {
    subscribers: Vec<Subscriber>,
    /// This instance holds a bus-level subscription for the topic
    bus_subscribed: bool,
}

/// Connection registry for WebSocket subscribers
///
/// Tracks which local connections listen on which topic and keeps exactly
/// one bus subscription per topic while at least one of them is connected.
/// Bus subscribe/unsubscribe for a topic run under that topic's gate, never
/// under the map lock, so a slow bus call only holds up its own topic.
#[derive(Clone)]
pub struct ConnectionRegistry {
    // topic -> local subscribers
    inner: Arc<RwLock<HashMap<Topic, TopicSubscription>>>,
    // topic -> serializes bus-level changes for that topic
    gates: Arc<DashMap<Topic, Arc<Mutex<()>>>>,
    bus: Arc<dyn EventBus>,
    directory: Arc<dyn ChannelDirectory>,
}

impl ConnectionRegistry {
    pub fn new(bus: Arc<dyn EventBus>, directory: Arc<dyn ChannelDirectory>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            gates: Arc::new(DashMap::new()),
            bus,
            directory,
        }
    }

    /// Topic a connection should listen on
    pub async fn resolve_topic(&self, descriptor: &TopicDescriptor) -> Result<Topic, RegistryError> {
        let channel_id = match descriptor {
            TopicDescriptor::Channel(channel_id) => channel_id.clone(),
            TopicDescriptor::Scenario(scenario_id) => self
                .directory
                .channel_for_scenario(scenario_id)
                .await?
                .ok_or_else(|| RegistryError::UnknownScenario(scenario_id.clone()))?,
        };
        if channel_id.is_reserved() {
            return Err(RegistryError::ReservedChannel(channel_id));
        }
        Ok(Topic::channel(&channel_id))
    }

    /// Add a subscriber to a topic
    ///
    /// Returns a tuple of (subscriber_id, receiver) where:
    /// - subscriber_id: Unique ID for this subscription (used for cleanup)
    /// - receiver: Channel to receive bus messages for the topic
    pub async fn subscribe(
        &self,
        topic: &Topic,
    ) -> Result<(SubscriberId, UnboundedReceiver<String>), RegistryError> {
        let gate = self.gate(topic);
        let serial = gate.lock().await;

        let needs_bus = {
            let guard = self.inner.read().await;
            guard.get(topic).map_or(true, |s| !s.bus_subscribed)
        };
        if needs_bus {
            if let Err(e) = self.bus.subscribe(topic.as_str()).await {
                drop(serial);
                self.release_gate(topic, gate);
                return Err(e.into());
            }
            tracing::info!(topic = %topic, "Subscribed to event bus topic");
        }

        let (tx, rx) = unbounded_channel();
        let subscriber_id = SubscriberId::new();
        {
            let mut guard = self.inner.write().await;
            let entry = guard.entry(topic.clone()).or_default();
            entry.bus_subscribed = true;
            entry.subscribers.push(Subscriber {
                id: subscriber_id,
                sender: tx,
            });

            tracing::debug!(
                topic = %topic,
                subscribers = entry.subscribers.len(),
                "Added subscriber {:?}",
                subscriber_id
            );
        }

        Ok((subscriber_id, rx))
    }

    /// Remove a specific subscriber from a topic
    ///
    /// Must be called when a WebSocket connection closes. The last subscriber
    /// out releases the bus subscription.
    pub async fn unsubscribe(&self, topic: &Topic, subscriber_id: SubscriberId) {
        let gate = self.gate(topic);
        let serial = gate.lock().await;

        let released = {
            let mut guard = self.inner.write().await;
            match guard.get_mut(topic) {
                None => Some(false),
                Some(entry) => {
                    entry.subscribers.retain(|s| s.id != subscriber_id);
                    if entry.subscribers.is_empty() {
                        let bus_subscribed = entry.bus_subscribed;
                        guard.remove(topic);
                        Some(bus_subscribed)
                    } else {
                        tracing::debug!(
                            topic = %topic,
                            remaining = entry.subscribers.len(),
                            "Removed subscriber {:?}",
                            subscriber_id
                        );
                        None
                    }
                }
            }
        };
        // Others still listen; the gate stays
        let Some(release_bus) = released else {
            return;
        };

        if release_bus {
            match self.bus.unsubscribe(topic.as_str()).await {
                Ok(()) => tracing::info!(topic = %topic, "Unsubscribed from event bus topic"),
                Err(e) => {
                    tracing::warn!(topic = %topic, error = %e, "Failed to unsubscribe from event bus topic")
                }
            }
        }
        drop(serial);
        self.release_gate(topic, gate);
    }

    fn gate(&self, topic: &Topic) -> Arc<Mutex<()>> {
        self.gates.entry(topic.clone()).or_default().clone()
    }

    /// Forget the gate once nobody else holds it
    fn release_gate(&self, topic: &Topic, gate: Arc<Mutex<()>>) {
        drop(gate);
        self.gates
            .remove_if(topic, |_, g| Arc::strong_count(g) == 1);
    }

    /// Publish a payload to every instance listening on the topic
    pub async fn publish(&self, topic: &Topic, payload: String) -> Result<usize, RegistryError> {
        Ok(self.bus.publish(topic.as_str(), payload).await?)
    }

    /// Re-publish a control message received from a connection
    ///
    /// Malformed payloads are logged and dropped; returns whether the message
    /// went out.
    pub async fn handle_inbound(&self, topic: &Topic, text: &str) -> Result<bool, RegistryError> {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(topic = %topic, error = %e, "Dropping malformed control message");
                return Ok(false);
            }
        };
        self.publish(topic, value.to_string()).await?;
        Ok(true)
    }

    /// Deliver a bus message to the local subscribers of its topic
    ///
    /// Subscribers whose connection already went away are skipped.
    pub async fn dispatch(&self, message: &BusMessage) -> usize {
        let guard = self.inner.read().await;
        let Some(entry) = guard.get(&Topic::from(message.topic.as_str())) else {
            return 0;
        };

        let mut delivered = 0;
        for subscriber in &entry.subscribers {
            if subscriber.sender.send(message.payload.clone()).is_ok() {
                delivered += 1;
            }
        }
        if delivered < entry.subscribers.len() {
            tracing::debug!(
                topic = %message.topic,
                skipped = entry.subscribers.len() - delivered,
                "Skipped closed subscribers"
            );
        }
        delivered
    }

    /// Pump bus messages into [`dispatch`](Self::dispatch) until the bus closes
    pub fn spawn_dispatcher(&self) -> JoinHandle<()> {
        let mut messages = self.bus.messages();
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                match messages.recv().await {
                    Ok(message) => {
                        registry.dispatch(&message).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Event bus dispatcher lagging, messages dropped");
                    }
                    Err(RecvError::Closed) => {
                        tracing::info!("Event bus closed, dispatcher exiting");
                        break;
                    }
                }
            }
        })
    }

    /// Get subscriber count for a topic (for debugging/metrics)
    pub async fn subscriber_count(&self, topic: &Topic) -> usize {
        let guard = self.inner.read().await;
        guard.get(topic).map(|s| s.subscribers.len()).unwrap_or(0)
    }

    pub async fn is_bus_subscribed(&self, topic: &Topic) -> bool {
        let guard = self.inner.read().await;
        guard.get(topic).map(|s| s.bus_subscribed).unwrap_or(false)
    }
}
