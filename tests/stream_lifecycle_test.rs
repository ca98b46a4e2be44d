//! Encoder and preview lifecycle through the public API

mod common;

use channel_control_service::models::{ChannelId, ChannelStatus, ScenarioId, StreamEvent};
use channel_control_service::repository::{ChannelDirectory, InMemoryChannelDirectory};
use channel_control_service::services::{ChannelStreamService, StatusMirror};
use channel_control_service::streaming::{
    EncoderSupervisor, FeedEvent, FfmpegSettings, PreviewMultiplexer, RunStatus,
};
use common::FakeLauncher;
use event_bus::{EventBus, InMemoryEventBus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct Harness {
    launcher: Arc<FakeLauncher>,
    directory: InMemoryChannelDirectory,
    bus: Arc<InMemoryEventBus>,
    supervisor: EncoderSupervisor,
    streams: ChannelStreamService,
}

async fn harness() -> Harness {
    let launcher = FakeLauncher::new();
    let directory = common::seeded_directory().await;
    let bus = Arc::new(InMemoryEventBus::new(64));
    let supervisor =
        EncoderSupervisor::new(launcher.clone(), bus.clone(), FfmpegSettings::default());
    let dir: Arc<dyn ChannelDirectory> = Arc::new(directory.clone());
    StatusMirror::new(dir.clone(), bus.clone()).spawn(supervisor.subscribe_status());
    let streams = ChannelStreamService::new(dir, supervisor.clone(), "rtmp://localhost/live");
    Harness {
        launcher,
        directory,
        bus,
        supervisor,
        streams,
    }
}

async fn next_event(rx: &mut broadcast::Receiver<StreamEvent>) -> StreamEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for lifecycle event")
        .expect("lifecycle channel closed")
}

async fn wait_for_status(directory: &InMemoryChannelDirectory, id: &ChannelId, want: ChannelStatus) {
    for _ in 0..100 {
        if directory.status_of(id).await == Some(want) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("channel {id} never reached {want}");
}

#[tokio::test]
async fn test_start_stop_round_trip_mirrors_status() {
    let h = harness().await;
    let c1 = ChannelId::new("c1");
    let mut events = h.supervisor.subscribe_events();

    h.streams.start(&c1).await.unwrap();
    assert_eq!(h.streams.status(&c1), RunStatus::Running);
    assert!(matches!(next_event(&mut events).await, StreamEvent::Started { .. }));
    wait_for_status(&h.directory, &c1, ChannelStatus::Running).await;

    assert!(h.streams.stop(&c1).success);
    assert_eq!(h.streams.status(&c1), RunStatus::Idle);
    assert!(matches!(next_event(&mut events).await, StreamEvent::Ended { .. }));
    wait_for_status(&h.directory, &c1, ChannelStatus::Stopped).await;
    assert_eq!(h.launcher.kills(), 1);
}

#[tokio::test]
async fn test_crash_surfaces_once_and_is_not_retried() {
    let h = harness().await;
    let c1 = ChannelId::new("c1");
    let mut events = h.supervisor.subscribe_events();
    let mut bus_rx = h.bus.messages();
    h.bus.subscribe("channel:c1").await.unwrap();

    h.streams.start(&c1).await.unwrap();
    assert!(matches!(next_event(&mut events).await, StreamEvent::Started { .. }));
    h.launcher.crash(0, "Connection refused").await;

    match next_event(&mut events).await {
        StreamEvent::Error { error, .. } => assert_eq!(error, "Connection refused"),
        other => panic!("expected STREAM_ERROR, got {other:?}"),
    }
    wait_for_status(&h.directory, &c1, ChannelStatus::Error).await;
    assert_eq!(h.streams.status(&c1), RunStatus::Idle);
    assert_eq!(h.launcher.launches(), 1);

    // Controllers on channel:c1 saw STARTED then ERROR, never ENDED
    let mut types = Vec::new();
    while let Ok(Ok(msg)) = tokio::time::timeout(Duration::from_millis(100), bus_rx.recv()).await {
        let value: serde_json::Value = serde_json::from_str(&msg.payload).unwrap();
        types.push(value["type"].as_str().unwrap_or_default().to_string());
    }
    assert_eq!(types, vec!["STREAM_STARTED", "STREAM_ERROR"]);

    // Restart is the caller's call
    h.streams.start(&c1).await.unwrap();
    assert_eq!(h.launcher.launches(), 2);
}

#[tokio::test]
async fn test_preview_shared_then_released() {
    let launcher = FakeLauncher::new();
    let previews = PreviewMultiplexer::new(launcher.clone(), FfmpegSettings::default(), 8);
    let s1 = ScenarioId::new("s1");

    let mut first = previews.attach(&s1).unwrap();
    let second = previews.attach(&s1).unwrap();
    assert_eq!(previews.subscriber_count(&s1), 2);
    assert_eq!(launcher.launches(), 1);

    launcher
        .emit(
            0,
            channel_control_service::streaming::ProcessEvent::Output(bytes::Bytes::from_static(
                b"\xff\xd8jpeg",
            )),
        )
        .await;
    let frame = tokio::time::timeout(Duration::from_secs(2), first.recv())
        .await
        .unwrap();
    assert!(matches!(frame, Some(FeedEvent::Frame(_))));

    previews.detach(first.handle());
    previews.detach(second.handle());
    previews.detach(second.handle());
    assert_eq!(previews.session_count(), 0);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(launcher.kills(), 1);
}
