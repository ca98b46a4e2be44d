//! Shared preview encoding
//!
//! One downscaled encoder per scenario, fanned out to every attached monitor
//! over a broadcast channel. A lagging consumer drops chunks instead of
//! holding the producer back.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::PreviewError;
use super::ffmpeg::FfmpegSettings;
use super::process::{KillSwitch, ProcessEvent, ProcessExit, ProcessLauncher};
use crate::models::ScenarioId;

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Frame(Bytes),
    /// The shared encoder failed; the session is gone
    Error(String),
}

/// Identifies one consumer of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedHandle {
    pub scenario_id: ScenarioId,
    session_id: Uuid,
    consumer_id: Uuid,
}

/// A consumer's view of the shared frame stream
pub struct FrameFeed {
    handle: FeedHandle,
    receiver: broadcast::Receiver<FeedEvent>,
}

impl FrameFeed {
    pub fn handle(&self) -> &FeedHandle {
        &self.handle
    }

    /// Next event; `None` once the session is closed
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(scenario_id = %self.handle.scenario_id, skipped, "Preview consumer lagging");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Stream form with lag gaps skipped
    pub fn into_stream(self) -> (FeedHandle, impl Stream<Item = FeedEvent>) {
        let scenario_id = self.handle.scenario_id.clone();
        let stream = BroadcastStream::new(self.receiver).filter_map(move |item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                debug!(scenario_id = %scenario_id, skipped, "Preview consumer lagging");
                None
            }
        });
        (self.handle, stream)
    }
}

struct Session {
    session_id: Uuid,
    consumers: HashSet<Uuid>,
    sender: broadcast::Sender<FeedEvent>,
    kill_switch: KillSwitch,
}

#[derive(Clone)]
pub struct PreviewMultiplexer {
    sessions: Arc<DashMap<ScenarioId, Session>>,
    launcher: Arc<dyn ProcessLauncher>,
    settings: Arc<FfmpegSettings>,
    buffer: usize,
}

impl PreviewMultiplexer {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, settings: FfmpegSettings, buffer: usize) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            launcher,
            settings: Arc::new(settings),
            buffer: buffer.max(1),
        }
    }

    /// Join the scenario's session, spawning the encoder on first attach
    pub fn attach(&self, scenario_id: &ScenarioId) -> Result<FrameFeed, PreviewError> {
        let consumer_id = Uuid::new_v4();

        match self.sessions.entry(scenario_id.clone()) {
            Entry::Occupied(mut slot) => {
                let session = slot.get_mut();
                session.consumers.insert(consumer_id);
                debug!(
                    scenario_id = %scenario_id,
                    subscribers = session.consumers.len(),
                    "Preview consumer attached"
                );
                Ok(FrameFeed {
                    handle: FeedHandle {
                        scenario_id: scenario_id.clone(),
                        session_id: session.session_id,
                        consumer_id,
                    },
                    receiver: session.sender.subscribe(),
                })
            }
            Entry::Vacant(slot) => {
                let source_url = self.settings.source_url(scenario_id);
                let command = self.settings.preview_command(&source_url);
                let handle = self.launcher.launch(&command)?;

                let session_id = Uuid::new_v4();
                let (sender, receiver) = broadcast::channel(self.buffer);
                let producer = sender.clone();
                slot.insert(Session {
                    session_id,
                    consumers: HashSet::from([consumer_id]),
                    sender,
                    kill_switch: handle.kill_switch,
                });
                info!(scenario_id = %scenario_id, pid = ?handle.pid, "Preview session started");

                let this = self.clone();
                let observed = scenario_id.clone();
                tokio::spawn(async move {
                    this.observe(observed, session_id, producer, handle.events)
                        .await
                });

                Ok(FrameFeed {
                    handle: FeedHandle {
                        scenario_id: scenario_id.clone(),
                        session_id,
                        consumer_id,
                    },
                    receiver,
                })
            }
        }
    }

    /// Leave the session; the last consumer out kills the encoder
    ///
    /// Unknown, stale or repeated handles are ignored.
    pub fn detach(&self, handle: &FeedHandle) {
        let Entry::Occupied(mut slot) = self.sessions.entry(handle.scenario_id.clone()) else {
            return;
        };
        if slot.get().session_id != handle.session_id {
            return;
        }
        if !slot.get_mut().consumers.remove(&handle.consumer_id) {
            return;
        }

        let remaining = slot.get().consumers.len();
        if remaining > 0 {
            debug!(scenario_id = %handle.scenario_id, subscribers = remaining, "Preview consumer detached");
            return;
        }

        let session = slot.remove();
        session.kill_switch.kill();
        info!(scenario_id = %handle.scenario_id, "Preview session closed");
    }

    pub fn subscriber_count(&self, scenario_id: &ScenarioId) -> usize {
        self.sessions
            .get(scenario_id)
            .map(|s| s.consumers.len())
            .unwrap_or(0)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Kill every preview encoder and clear the map
    pub fn shutdown(&self) -> usize {
        let scenarios: Vec<ScenarioId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for scenario_id in scenarios {
            if let Some((_, session)) = self.sessions.remove(&scenario_id) {
                session.kill_switch.kill();
                closed += 1;
            }
        }
        closed
    }

    async fn observe(
        &self,
        scenario_id: ScenarioId,
        session_id: Uuid,
        producer: broadcast::Sender<FeedEvent>,
        mut events: mpsc::Receiver<ProcessEvent>,
    ) {
        let exit = loop {
            match events.recv().await {
                Some(ProcessEvent::Output(chunk)) => {
                    // No receivers just means everyone left
                    let _ = producer.send(FeedEvent::Frame(chunk));
                }
                Some(ProcessEvent::Exited(exit)) => break exit,
                Some(ProcessEvent::Started { .. } | ProcessEvent::Progress(_)) => {}
                None => break ProcessExit::Failed("preview monitor closed unexpectedly".into()),
            }
        };

        match &exit {
            ProcessExit::Failed(reason) => {
                error!(scenario_id = %scenario_id, error = %reason, "Preview encoder failed");
                let _ = producer.send(FeedEvent::Error(reason.clone()));
            }
            ProcessExit::Completed => {
                warn!(scenario_id = %scenario_id, "Preview encoder exited");
            }
            ProcessExit::Killed => {}
        }

        let removed = self
            .sessions
            .remove_if(&scenario_id, |_, session| session.session_id == session_id);
        if removed.is_some() {
            info!(scenario_id = %scenario_id, "Preview session torn down after encoder exit");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::process::testing::ScriptedLauncher;
    use std::time::Duration;

    fn multiplexer(launcher: &Arc<ScriptedLauncher>) -> PreviewMultiplexer {
        PreviewMultiplexer::new(launcher.clone(), FfmpegSettings::default(), 16)
    }

    async fn recv(feed: &mut FrameFeed) -> Option<FeedEvent> {
        tokio::time::timeout(Duration::from_secs(2), feed.recv())
            .await
            .expect("timed out waiting for feed")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_attach_twice_shares_one_process() {
        let launcher = ScriptedLauncher::new();
        let mux = multiplexer(&launcher);
        let s1 = ScenarioId::new("s1");

        let first = mux.attach(&s1).unwrap();
        assert_eq!(mux.subscriber_count(&s1), 1);
        let second = mux.attach(&s1).unwrap();
        assert_eq!(mux.subscriber_count(&s1), 2);
        assert_eq!(launcher.launches(), 1);
        assert!(launcher.process(0).spec.capture_stdout);

        mux.detach(first.handle());
        assert_eq!(mux.subscriber_count(&s1), 1);
        settle().await;
        assert_eq!(launcher.kills(), 0);

        mux.detach(second.handle());
        assert_eq!(mux.session_count(), 0);
        settle().await;
        assert_eq!(launcher.kills(), 1);
    }

    #[tokio::test]
    async fn test_every_consumer_gets_every_frame() {
        let launcher = ScriptedLauncher::new();
        let mux = multiplexer(&launcher);
        let s1 = ScenarioId::new("s1");

        let mut a = mux.attach(&s1).unwrap();
        let mut b = mux.attach(&s1).unwrap();
        let process = launcher.process(0);
        for chunk in [&b"one"[..], &b"two"[..]] {
            process
                .emit(ProcessEvent::Output(Bytes::from_static(chunk)))
                .await;
        }

        for feed in [&mut a, &mut b] {
            assert_eq!(recv(feed).await, Some(FeedEvent::Frame(Bytes::from_static(b"one"))));
            assert_eq!(recv(feed).await, Some(FeedEvent::Frame(Bytes::from_static(b"two"))));
        }
    }

    #[tokio::test]
    async fn test_concurrent_attach_detach_kills_once() {
        let launcher = ScriptedLauncher::new();
        let mux = multiplexer(&launcher);
        let s1 = ScenarioId::new("s1");

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let mux = mux.clone();
            let s1 = s1.clone();
            tasks.push(tokio::spawn(async move { mux.attach(&s1).unwrap() }));
        }
        let mut feeds = Vec::new();
        for task in tasks {
            feeds.push(task.await.unwrap());
        }
        assert_eq!(mux.subscriber_count(&s1), 32);
        assert_eq!(launcher.launches(), 1);

        let mut tasks = Vec::new();
        for feed in feeds {
            let mux = mux.clone();
            tasks.push(tokio::spawn(async move { mux.detach(feed.handle()) }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(mux.session_count(), 0);
        settle().await;
        assert_eq!(launcher.kills(), 1);
    }

    #[tokio::test]
    async fn test_detach_is_tolerant() {
        let launcher = ScriptedLauncher::new();
        let mux = multiplexer(&launcher);
        let s1 = ScenarioId::new("s1");

        let a = mux.attach(&s1).unwrap();
        let _b = mux.attach(&s1).unwrap();

        // Same consumer twice must not steal the other's slot
        mux.detach(a.handle());
        mux.detach(a.handle());
        assert_eq!(mux.subscriber_count(&s1), 1);

        let stray = FeedHandle {
            scenario_id: ScenarioId::new("never-attached"),
            session_id: Uuid::new_v4(),
            consumer_id: Uuid::new_v4(),
        };
        mux.detach(&stray);
        assert_eq!(mux.session_count(), 1);
    }

    #[tokio::test]
    async fn test_process_failure_signals_and_tears_down() {
        let launcher = ScriptedLauncher::new();
        let mux = multiplexer(&launcher);
        let s1 = ScenarioId::new("s1");

        let mut a = mux.attach(&s1).unwrap();
        let mut b = mux.attach(&s1).unwrap();
        launcher
            .process(0)
            .emit(ProcessEvent::Exited(ProcessExit::Failed("renderer gone".into())))
            .await;

        for feed in [&mut a, &mut b] {
            assert_eq!(recv(feed).await, Some(FeedEvent::Error("renderer gone".into())));
            assert_eq!(recv(feed).await, None);
        }
        assert_eq!(mux.session_count(), 0);

        // Late detach from a failed session is harmless
        mux.detach(a.handle());

        // Re-attach spawns a fresh encoder
        let fresh = mux.attach(&s1).unwrap();
        assert_eq!(launcher.launches(), 2);
        assert_ne!(fresh.handle().session_id, a.handle().session_id);

        // Detaching the old handle does not touch the new session
        mux.detach(b.handle());
        assert_eq!(mux.subscriber_count(&s1), 1);
    }

    #[tokio::test]
    async fn test_clean_exit_closes_feed_without_error() {
        let launcher = ScriptedLauncher::new();
        let mux = multiplexer(&launcher);
        let s1 = ScenarioId::new("s1");

        let mut feed = mux.attach(&s1).unwrap();
        launcher
            .process(0)
            .emit(ProcessEvent::Exited(ProcessExit::Completed))
            .await;

        assert_eq!(recv(&mut feed).await, None);
        assert_eq!(mux.session_count(), 0);
    }

    #[tokio::test]
    async fn test_independent_scenarios() {
        let launcher = ScriptedLauncher::new();
        let mux = multiplexer(&launcher);

        let a = mux.attach(&ScenarioId::new("s1")).unwrap();
        let _b = mux.attach(&ScenarioId::new("s2")).unwrap();
        assert_eq!(mux.session_count(), 2);

        mux.detach(a.handle());
        assert_eq!(mux.session_count(), 1);
        assert_eq!(mux.subscriber_count(&ScenarioId::new("s2")), 1);
    }

    #[tokio::test]
    async fn test_shutdown_kills_all_sessions() {
        let launcher = ScriptedLauncher::new();
        let mux = multiplexer(&launcher);
        let _a = mux.attach(&ScenarioId::new("s1")).unwrap();
        let _b = mux.attach(&ScenarioId::new("s2")).unwrap();

        assert_eq!(mux.shutdown(), 2);
        assert_eq!(mux.session_count(), 0);
        settle().await;
        assert_eq!(launcher.kills(), 2);
    }
}
