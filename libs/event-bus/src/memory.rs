//! In-process bus
//!
//! An [`InMemoryHub`] plays the role of the broker; every [`InMemoryEventBus`]
//! connected to the same hub behaves like a separate server instance with its
//! own subscription set.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{BusMessage, EventBus, Result};

struct Node {
    topics: Mutex<HashSet<String>>,
    incoming: broadcast::Sender<BusMessage>,
}

impl Node {
    fn is_subscribed(&self, topic: &str) -> bool {
        self.topics
            .lock()
            .map(|topics| topics.contains(topic))
            .unwrap_or(false)
    }
}

/// Shared broker for in-process buses
#[derive(Clone, Default)]
pub struct InMemoryHub {
    nodes: Arc<Mutex<Vec<Weak<Node>>>>,
}

impl InMemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, node: &Arc<Node>) {
        if let Ok(mut nodes) = self.nodes.lock() {
            nodes.retain(|n| n.strong_count() > 0);
            nodes.push(Arc::downgrade(node));
        }
    }

    fn deliver(&self, msg: BusMessage) -> usize {
        let live: Vec<Arc<Node>> = match self.nodes.lock() {
            Ok(mut nodes) => {
                nodes.retain(|n| n.strong_count() > 0);
                nodes.iter().filter_map(Weak::upgrade).collect()
            }
            Err(_) => return 0,
        };

        let mut delivered = 0;
        for node in live.iter().filter(|n| n.is_subscribed(&msg.topic)) {
            // A node without local listeners still counts as a bus subscriber.
            let _ = node.incoming.send(msg.clone());
            delivered += 1;
        }
        delivered
    }
}

/// Bus handle for one simulated instance
#[derive(Clone)]
pub struct InMemoryEventBus {
    hub: InMemoryHub,
    node: Arc<Node>,
}

impl InMemoryEventBus {
    /// Create a bus on a private hub
    pub fn new(buffer: usize) -> Self {
        Self::connect(&InMemoryHub::new(), buffer)
    }

    /// Join an existing hub as a new instance
    pub fn connect(hub: &InMemoryHub, buffer: usize) -> Self {
        let (incoming, _) = broadcast::channel(buffer.max(1));
        let node = Arc::new(Node {
            topics: Mutex::new(HashSet::new()),
            incoming,
        });
        hub.register(&node);
        Self {
            hub: hub.clone(),
            node,
        }
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.node.is_subscribed(topic)
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<usize> {
        let delivered = self.hub.deliver(BusMessage::new(topic, payload));
        debug!(topic = %topic, subscribers = delivered, "Published bus message");
        Ok(delivered)
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        if let Ok(mut topics) = self.node.topics.lock() {
            topics.insert(topic.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        if let Ok(mut topics) = self.node.topics.lock() {
            topics.remove(topic);
        }
        Ok(())
    }

    fn messages(&self) -> broadcast::Receiver<BusMessage> {
        self.node.incoming.subscribe()
    }
}
