//! Encoder supervisor
//!
//! Owns the channel -> job map. Each job has exactly one observer task that
//! consumes the process events, drives the job state machine, publishes the
//! lifecycle events on `channel:<id>` and removes the job once the process
//! is gone.
//!
//! A job that was stopped, or whose process exited, stays in a draining set
//! until its terminal event is out. A channel cannot start again while it
//! drains, so events of consecutive jobs on one channel never interleave.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use event_bus::{publish_json, EventBus};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::SupervisorError;
use super::ffmpeg::FfmpegSettings;
use super::process::{KillSwitch, ProcessEvent, ProcessExit, ProcessLauncher};
use super::state::{EncoderState, JobTransition};
use crate::models::{ChannelId, ScenarioId, StreamEvent, Topic};

const LIFECYCLE_BUFFER: usize = 256;
/// Upper bound on waiting for a stopped encoder to be reaped
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// What the caller resolved as the channel's on-screen content
#[derive(Debug, Clone, Default)]
pub struct SourceDescriptor {
    pub active_scenario: Option<ScenarioId>,
}

impl SourceDescriptor {
    pub fn scenario(id: ScenarioId) -> Self {
        Self {
            active_scenario: Some(id),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncoderJob {
    pub job_id: Uuid,
    pub channel_id: ChannelId,
    pub scenario_id: ScenarioId,
    pub state: EncoderState,
    pub source_url: String,
    pub destination_url: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Idle,
}

struct JobEntry {
    job: EncoderJob,
    kill_switch: KillSwitch,
    reaped: watch::Receiver<bool>,
}

/// A job that left the map but whose terminal event is not out yet
struct Draining {
    job_id: Uuid,
    reaped: watch::Receiver<bool>,
}

#[derive(Clone)]
pub struct EncoderSupervisor {
    jobs: Arc<DashMap<ChannelId, JobEntry>>,
    draining: Arc<DashMap<ChannelId, Draining>>,
    launcher: Arc<dyn ProcessLauncher>,
    bus: Arc<dyn EventBus>,
    settings: Arc<FfmpegSettings>,
    lifecycle: broadcast::Sender<StreamEvent>,
    status_listeners: Arc<Mutex<Vec<mpsc::UnboundedSender<StreamEvent>>>>,
}

impl EncoderSupervisor {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        bus: Arc<dyn EventBus>,
        settings: FfmpegSettings,
    ) -> Self {
        let (lifecycle, _) = broadcast::channel(LIFECYCLE_BUFFER);
        Self {
            jobs: Arc::new(DashMap::new()),
            draining: Arc::new(DashMap::new()),
            launcher,
            bus,
            settings: Arc::new(settings),
            lifecycle,
            status_listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawn the encoder for a channel
    ///
    /// Check-and-insert happens under the map entry, so of two concurrent
    /// starts for the same channel exactly one launches a process.
    pub fn start(
        &self,
        channel_id: &ChannelId,
        source: SourceDescriptor,
        destination_url: &str,
    ) -> Result<EncoderJob, SupervisorError> {
        if channel_id.is_reserved() {
            return Err(SupervisorError::ReservedChannel(channel_id.clone()));
        }

        let slot = match self.jobs.entry(channel_id.clone()) {
            Entry::Occupied(_) => {
                return Err(SupervisorError::AlreadyRunning(channel_id.clone()));
            }
            Entry::Vacant(slot) => slot,
        };
        if self.draining.contains_key(channel_id) {
            return Err(SupervisorError::Stopping(channel_id.clone()));
        }

        let scenario_id = source
            .active_scenario
            .ok_or_else(|| SupervisorError::NoActiveSource(channel_id.clone()))?;

        let source_url = self.settings.source_url(&scenario_id);
        let command = self.settings.encoder_command(&source_url, destination_url);
        let handle = self.launcher.launch(&command)?;

        let job = EncoderJob {
            job_id: Uuid::new_v4(),
            channel_id: channel_id.clone(),
            scenario_id,
            state: EncoderState::Starting,
            source_url,
            destination_url: destination_url.to_string(),
            started_at: Utc::now(),
        };
        let (reaped_tx, reaped) = watch::channel(false);
        slot.insert(JobEntry {
            job: job.clone(),
            kill_switch: handle.kill_switch,
            reaped,
        });

        info!(
            channel_id = %channel_id,
            job_id = %job.job_id,
            pid = ?handle.pid,
            "Encoder launched"
        );

        let this = self.clone();
        let observed = job.clone();
        tokio::spawn(async move { this.observe(observed, handle.events, reaped_tx).await });

        Ok(job)
    }

    /// Signal the encoder and drop the job; the exit is reconciled later
    pub fn stop(&self, channel_id: &ChannelId) -> Result<EncoderJob, SupervisorError> {
        let entry = self
            .retire(channel_id, None)
            .ok_or_else(|| SupervisorError::NotRunning(channel_id.clone()))?;

        entry.kill_switch.kill();
        info!(channel_id = %channel_id, job_id = %entry.job.job_id, "Encoder stop requested");
        Ok(entry.job)
    }

    /// Wait until the previous job on the channel has published its
    /// terminal event
    ///
    /// Returns at once when nothing drains; gives up after a bounded wait.
    pub async fn wait_idle(&self, channel_id: &ChannelId) {
        let Some(mut reaped) = self.draining.get(channel_id).map(|d| d.reaped.clone()) else {
            return;
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, reaped.wait_for(|done| *done)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => {
                // Observer gone without reporting
                self.draining
                    .remove_if(channel_id, |_, d| d.reaped.has_changed().is_err());
            }
            Err(_) => {
                warn!(channel_id = %channel_id, "Previous encoder still draining");
            }
        };
    }

    pub fn status(&self, channel_id: &ChannelId) -> RunStatus {
        if self.jobs.contains_key(channel_id) {
            RunStatus::Running
        } else {
            RunStatus::Idle
        }
    }

    pub fn job(&self, channel_id: &ChannelId) -> Option<EncoderJob> {
        self.jobs.get(channel_id).map(|entry| entry.job.clone())
    }

    pub fn active_jobs(&self) -> Vec<EncoderJob> {
        let mut jobs: Vec<EncoderJob> = self.jobs.iter().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        jobs
    }

    /// Local copy of every lifecycle event this supervisor publishes
    ///
    /// Lossy under load; progress telemetry shares the buffer.
    pub fn subscribe_events(&self) -> broadcast::Receiver<StreamEvent> {
        self.lifecycle.subscribe()
    }

    /// Every status-changing event, in order and without loss
    pub fn subscribe_status(&self) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.status_listeners.lock() {
            Ok(mut listeners) => listeners.push(tx),
            Err(poisoned) => poisoned.into_inner().push(tx),
        }
        rx
    }

    /// Kill every encoder and clear the map
    pub fn shutdown(&self) -> usize {
        let channels: Vec<ChannelId> = self.jobs.iter().map(|e| e.key().clone()).collect();
        let mut stopped = 0;
        for channel_id in channels {
            if let Some(entry) = self.retire(&channel_id, None) {
                entry.kill_switch.kill();
                stopped += 1;
            }
        }
        if stopped > 0 {
            info!(stopped, "Encoder supervisor drained");
        }
        stopped
    }

    /// Move a job from the map to the draining set in one step
    ///
    /// With `job_id` set, only that job is retired.
    fn retire(&self, channel_id: &ChannelId, job_id: Option<Uuid>) -> Option<JobEntry> {
        let Entry::Occupied(slot) = self.jobs.entry(channel_id.clone()) else {
            return None;
        };
        if job_id.is_some_and(|id| slot.get().job.job_id != id) {
            return None;
        }
        self.draining.insert(
            channel_id.clone(),
            Draining {
                job_id: slot.get().job.job_id,
                reaped: slot.get().reaped.clone(),
            },
        );
        Some(slot.remove())
    }

    async fn observe(
        &self,
        job: EncoderJob,
        mut events: mpsc::Receiver<ProcessEvent>,
        reaped: watch::Sender<bool>,
    ) {
        let channel_id = job.channel_id.clone();
        let mut state = EncoderState::Starting;

        let exit = loop {
            let Some(event) = events.recv().await else {
                break ProcessExit::Failed("encoder monitor closed unexpectedly".to_string());
            };
            match event {
                ProcessEvent::Started { command_line } => {
                    let Some(next) = state.apply(JobTransition::Launched) else {
                        continue;
                    };
                    state = next;
                    self.record_state(&job, state);
                    info!(channel_id = %channel_id, command = %command_line, "Encoder running");
                    self.emit(StreamEvent::Started {
                        channel_id: channel_id.clone(),
                    })
                    .await;
                }
                ProcessEvent::Progress(metrics) => {
                    debug!(
                        channel_id = %channel_id,
                        frames = ?metrics.frames,
                        fps = ?metrics.fps,
                        timemark = ?metrics.timemark,
                        "Encoder progress"
                    );
                    self.emit(StreamEvent::Progress {
                        channel_id: channel_id.clone(),
                        metrics,
                    })
                    .await;
                }
                ProcessEvent::Output(_) => {}
                ProcessEvent::Exited(exit) => break exit,
            }
        };

        self.finish(&job, state, exit).await;

        self.draining
            .remove_if(&channel_id, |_, d| d.job_id == job.job_id);
        let _ = reaped.send(true);
    }

    async fn finish(&self, job: &EncoderJob, state: EncoderState, exit: ProcessExit) {
        let channel_id = job.channel_id.clone();
        let job_id = job.job_id;
        self.retire(&channel_id, Some(job_id));

        let (transition, event) = match exit {
            ProcessExit::Killed => {
                info!(channel_id = %channel_id, "Encoder stopped");
                (JobTransition::Ended, StreamEvent::Ended { channel_id })
            }
            ProcessExit::Completed => {
                info!(channel_id = %channel_id, "Encoder finished");
                (JobTransition::Ended, StreamEvent::Ended { channel_id })
            }
            ProcessExit::Failed(error) => {
                error!(channel_id = %channel_id, error = %error, "Encoder failed");
                (JobTransition::Failed, StreamEvent::Error { channel_id, error })
            }
        };

        if state.apply(transition).is_none() {
            warn!(job_id = %job_id, ?state, "Exit observed for a settled job");
            return;
        }
        self.emit(event).await;
    }

    fn record_state(&self, job: &EncoderJob, state: EncoderState) {
        if let Some(mut entry) = self.jobs.get_mut(&job.channel_id) {
            if entry.job.job_id == job.job_id {
                entry.job.state = state;
            }
        }
    }

    async fn emit(&self, event: StreamEvent) {
        let topic = Topic::channel(event.channel_id());
        if let Err(e) = publish_json(self.bus.as_ref(), topic.as_str(), &event).await {
            error!(topic = %topic, event = event.type_name(), error = %e, "Failed to publish stream event");
        }

        if event.implied_status().is_some() {
            let mut listeners = match self.status_listeners.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            listeners.retain(|tx| tx.send(event.clone()).is_ok());
        }

        // No local listeners is fine
        let _ = self.lifecycle.send(event);
    }
}
