//! Fan-out registry over the in-process bus
//!
//! Several registries joined to one hub stand in for several server
//! instances sharing Redis.

mod common;

use channel_control_service::models::{ChannelId, Topic};
use channel_control_service::repository::ChannelDirectory;
use channel_control_service::websocket::{ConnectionRegistry, RegistryError, TopicDescriptor};
use event_bus::{InMemoryEventBus, InMemoryHub};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

async fn instance(hub: &InMemoryHub) -> ConnectionRegistry {
    let directory: Arc<dyn ChannelDirectory> = Arc::new(common::seeded_directory().await);
    let registry = ConnectionRegistry::new(Arc::new(InMemoryEventBus::connect(hub, 64)), directory);
    registry.spawn_dispatcher();
    registry
}

async fn next(rx: &mut UnboundedReceiver<String>) -> Option<String> {
    tokio::time::timeout(Duration::from_millis(300), rx.recv())
        .await
        .ok()
        .flatten()
}

#[tokio::test]
async fn test_control_message_reaches_peers_on_same_channel_only() {
    let hub = InMemoryHub::new();
    let registry = instance(&hub).await;

    let c1 = registry
        .resolve_topic(&TopicDescriptor::Channel(ChannelId::new("c1")))
        .await
        .unwrap();
    let c2 = registry
        .resolve_topic(&TopicDescriptor::Channel(ChannelId::new("c2")))
        .await
        .unwrap();

    let (_a, mut rx_a) = registry.subscribe(&c1).await.unwrap();
    let (_b, mut rx_b) = registry.subscribe(&c1).await.unwrap();
    let (_c, mut rx_c) = registry.subscribe(&c2).await.unwrap();

    // Socket A sends a control message
    let sent = registry
        .handle_inbound(&c1, r#"{"type":"ACTION","action":"next-slide"}"#)
        .await
        .unwrap();
    assert!(sent);

    let expected = r#"{"action":"next-slide","type":"ACTION"}"#;
    let got_b: serde_json::Value = serde_json::from_str(&next(&mut rx_b).await.unwrap()).unwrap();
    let got_a: serde_json::Value = serde_json::from_str(&next(&mut rx_a).await.unwrap()).unwrap();
    let expected: serde_json::Value = serde_json::from_str(expected).unwrap();
    assert_eq!(got_b, expected);
    assert_eq!(got_a, expected);
    assert_eq!(next(&mut rx_c).await, None);
}

#[tokio::test]
async fn test_scenario_socket_joins_owner_channel() {
    let hub = InMemoryHub::new();
    let registry = instance(&hub).await;

    let by_scenario = registry
        .resolve_topic(&TopicDescriptor::from_parts(None, Some("s1")).unwrap())
        .await
        .unwrap();
    assert_eq!(by_scenario, Topic::channel(&ChannelId::new("c1")));

    let (_id, mut renderer) = registry.subscribe(&by_scenario).await.unwrap();
    registry
        .publish(&Topic::channel(&ChannelId::new("c1")), r#"{"type":"PING"}"#.into())
        .await
        .unwrap();
    assert_eq!(next(&mut renderer).await.as_deref(), Some(r#"{"type":"PING"}"#));

    let unknown = registry
        .resolve_topic(&TopicDescriptor::from_parts(None, Some("missing")).unwrap())
        .await;
    assert!(matches!(unknown, Err(RegistryError::UnknownScenario(_))));
}

#[tokio::test]
async fn test_events_cross_instances() {
    let hub = InMemoryHub::new();
    let first = instance(&hub).await;
    let second = instance(&hub).await;
    let topic = Topic::channel(&ChannelId::new("c1"));

    let (_x, mut on_first) = first.subscribe(&topic).await.unwrap();
    let (_y, mut on_second) = second.subscribe(&topic).await.unwrap();

    second
        .publish(&topic, r#"{"type":"STREAM_STARTED","channelId":"c1"}"#.into())
        .await
        .unwrap();

    assert!(next(&mut on_first).await.is_some());
    assert!(next(&mut on_second).await.is_some());
}

#[tokio::test]
async fn test_last_disconnect_stops_cross_instance_delivery() {
    let hub = InMemoryHub::new();
    let listener = instance(&hub).await;
    let publisher = instance(&hub).await;
    let topic = Topic::channel(&ChannelId::new("c1"));

    let (id, _rx) = listener.subscribe(&topic).await.unwrap();
    assert_eq!(publisher.publish(&topic, "{}".into()).await.unwrap(), 1);

    listener.unsubscribe(&topic, id).await;
    assert!(!listener.is_bus_subscribed(&topic).await);
    assert_eq!(publisher.publish(&topic, "{}".into()).await.unwrap(), 0);
}
