//! Redis pub/sub bus
//!
//! Publishing goes through a shared `ConnectionManager`. Subscriptions live on
//! a dedicated pub/sub connection owned by a driver task; subscribe and
//! unsubscribe requests are sent to the driver and acknowledged once Redis has
//! confirmed them. If the pub/sub connection drops, the driver reconnects and
//! restores every topic it was subscribed to.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client, RedisResult};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::{BusMessage, EventBus, EventBusError, Result};

const COMMAND_BUFFER: usize = 64;
const RECONNECT_DELAY_MS: u64 = 500;
const MAX_RECONNECT_DELAY_MS: u64 = 5_000;

enum Command {
    Subscribe {
        topic: String,
        ack: oneshot::Sender<RedisResult<()>>,
    },
    Unsubscribe {
        topic: String,
        ack: oneshot::Sender<RedisResult<()>>,
    },
}

/// Event bus backed by Redis PUBLISH / SUBSCRIBE
pub struct RedisEventBus {
    publisher: ConnectionManager,
    commands: mpsc::Sender<Command>,
    incoming: broadcast::Sender<BusMessage>,
    driver: JoinHandle<()>,
}

impl RedisEventBus {
    /// Connect both the publishing and the subscribing side
    ///
    /// `buffer` bounds the in-process queue of received messages; a local
    /// consumer that falls further behind skips the oldest ones.
    pub async fn connect(redis_url: &str, buffer: usize) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        let pubsub = client.get_async_pubsub().await?;

        let (incoming, _) = broadcast::channel(buffer.max(1));
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);

        let driver = tokio::spawn(drive(client, pubsub, command_rx, incoming.clone()));

        info!("Redis event bus connected");

        Ok(Self {
            publisher,
            commands,
            incoming,
            driver,
        })
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<RedisResult<()>>) -> Command,
    ) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(make(ack))
            .await
            .map_err(|_| EventBusError::DriverClosed)?;
        done.await.map_err(|_| EventBusError::DriverClosed)??;
        Ok(())
    }
}

impl Drop for RedisEventBus {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, topic: &str, payload: String) -> Result<usize> {
        let mut conn = self.publisher.clone();
        let receivers: usize = conn.publish(topic, payload).await?;
        debug!(topic = %topic, subscribers = receivers, "Published bus message");
        Ok(receivers)
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        let topic = topic.to_string();
        self.request(|ack| Command::Subscribe { topic, ack }).await
    }

    async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let topic = topic.to_string();
        self.request(|ack| Command::Unsubscribe { topic, ack })
            .await
    }

    fn messages(&self) -> broadcast::Receiver<BusMessage> {
        self.incoming.subscribe()
    }
}

async fn drive(
    client: Client,
    mut pubsub: PubSub,
    mut commands: mpsc::Receiver<Command>,
    incoming: broadcast::Sender<BusMessage>,
) {
    let mut topics: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    debug!("Event bus handle dropped, stopping driver");
                    break;
                };
                match command {
                    Command::Subscribe { topic, ack } => {
                        let result = pubsub.subscribe(&topic).await;
                        if result.is_ok() {
                            info!(topic = %topic, "Subscribed to bus topic");
                            topics.insert(topic);
                        }
                        let _ = ack.send(result);
                    }
                    Command::Unsubscribe { topic, ack } => {
                        let result = pubsub.unsubscribe(&topic).await;
                        if result.is_ok() {
                            info!(topic = %topic, "Unsubscribed from bus topic");
                            topics.remove(&topic);
                        }
                        let _ = ack.send(result);
                    }
                }
            }
            msg = async { pubsub.on_message().next().await } => {
                match msg {
                    Some(msg) => {
                        let payload = match msg.get_payload::<String>() {
                            Ok(p) => p,
                            Err(e) => {
                                error!(error = ?e, "Failed to get bus message payload");
                                continue;
                            }
                        };
                        let topic = msg.get_channel_name().to_string();
                        // No local receiver is not an error.
                        let _ = incoming.send(BusMessage { topic, payload });
                    }
                    None => {
                        warn!("Redis pub/sub stream ended, reconnecting");
                        pubsub = reconnect(&client, &topics).await;
                    }
                }
            }
        }
    }
}

async fn reconnect(client: &Client, topics: &HashSet<String>) -> PubSub {
    let mut delay = Duration::from_millis(RECONNECT_DELAY_MS);

    loop {
        sleep(delay).await;

        match restore(client, topics).await {
            Ok(pubsub) => {
                info!(topics = topics.len(), "Redis pub/sub connection restored");
                return pubsub;
            }
            Err(e) => {
                error!(error = %e, "Redis pub/sub reconnect failed");
                delay = (delay * 2).min(Duration::from_millis(MAX_RECONNECT_DELAY_MS));
            }
        }
    }
}

async fn restore(client: &Client, topics: &HashSet<String>) -> RedisResult<PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    for topic in topics {
        pubsub.subscribe(topic).await?;
    }
    Ok(pubsub)
}
