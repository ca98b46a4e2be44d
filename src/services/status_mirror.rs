//! Mirrors encoder lifecycle into persisted channel status
//!
//! STARTED -> RUNNING, ERROR -> ERROR, ENDED -> STOPPED. Each write is
//! followed by a `CHANNEL_STATUS_CHANGED` notice on `channel:all`. Failures
//! are logged and never reach the supervisor.

use event_bus::{publish_json, EventBus};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::models::{ChannelNotice, ChannelStatus, StreamEvent, Topic};
use crate::repository::ChannelDirectory;

#[derive(Clone)]
pub struct StatusMirror {
    directory: Arc<dyn ChannelDirectory>,
    bus: Arc<dyn EventBus>,
}

impl StatusMirror {
    pub fn new(directory: Arc<dyn ChannelDirectory>, bus: Arc<dyn EventBus>) -> Self {
        Self { directory, bus }
    }

    /// Persist the status implied by `event`; returns what was written
    pub async fn apply(&self, event: &StreamEvent) -> Option<ChannelStatus> {
        let status = event.implied_status()?;
        let channel_id = event.channel_id();

        if let Err(e) = self.directory.update_status(channel_id, status).await {
            error!(channel_id = %channel_id, %status, error = %e, "Failed to mirror channel status");
            return None;
        }
        debug!(channel_id = %channel_id, %status, "Channel status mirrored");

        let notice = ChannelNotice::StatusChanged {
            channel_id: channel_id.clone(),
            status,
        };
        let topic = Topic::all();
        if let Err(e) = publish_json(self.bus.as_ref(), topic.as_str(), &notice).await {
            warn!(channel_id = %channel_id, error = %e, "Failed to publish status notice");
        }
        Some(status)
    }

    /// Apply events in arrival order until the supervisor goes away
    pub fn spawn(self, mut events: UnboundedReceiver<StreamEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.apply(&event).await;
            }
            debug!("Status mirror stopped");
        })
    }
}
