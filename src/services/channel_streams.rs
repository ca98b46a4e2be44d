use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::models::{ChannelId, ScenarioId};
use crate::repository::{ChannelDirectory, DirectoryError};
use crate::streaming::{
    EncoderJob, EncoderSupervisor, RunStatus, SourceDescriptor, SupervisorError,
};
use crate::websocket::message_types::MonitorParams;

#[derive(Debug, Error)]
pub enum StreamServiceError {
    #[error("channel not found: {0}")]
    ChannelNotFound(ChannelId),

    #[error("no scenario to preview for channel {0}")]
    NoPreviewSource(ChannelId),

    #[error("scenarioId or channelId is required")]
    MissingIdentifier,

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
    pub success: bool,
    pub message: String,
}

/// Channel-level start/stop on top of the encoder supervisor
#[derive(Clone)]
pub struct ChannelStreamService {
    directory: Arc<dyn ChannelDirectory>,
    supervisor: EncoderSupervisor,
    default_destination: String,
}

impl ChannelStreamService {
    pub fn new(
        directory: Arc<dyn ChannelDirectory>,
        supervisor: EncoderSupervisor,
        default_destination: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            supervisor,
            default_destination: default_destination.into(),
        }
    }

    pub async fn start(&self, channel_id: &ChannelId) -> Result<EncoderJob, StreamServiceError> {
        // Cheap rejection before the lookups; the supervisor re-checks atomically
        if self.supervisor.status(channel_id) == RunStatus::Running {
            return Err(SupervisorError::AlreadyRunning(channel_id.clone()).into());
        }

        let channel = self
            .directory
            .find_channel(channel_id)
            .await?
            .ok_or_else(|| StreamServiceError::ChannelNotFound(channel_id.clone()))?;
        let active_scenario = self.directory.active_scenario(channel_id).await?;
        let destination = channel.destination_url(&self.default_destination);

        // A just-stopped job must publish its terminal event first
        self.supervisor.wait_idle(channel_id).await;

        let job = self.supervisor.start(
            channel_id,
            SourceDescriptor { active_scenario },
            &destination,
        )?;
        info!(channel_id = %channel_id, scenario_id = %job.scenario_id, "Stream start accepted");
        Ok(job)
    }

    /// Nothing running is reported, not raised
    pub fn stop(&self, channel_id: &ChannelId) -> StopOutcome {
        match self.supervisor.stop(channel_id) {
            Ok(_) => StopOutcome {
                success: true,
                message: "Stream stopped".to_string(),
            },
            Err(SupervisorError::NotRunning(_)) => StopOutcome {
                success: false,
                message: "No active stream found".to_string(),
            },
            Err(other) => StopOutcome {
                success: false,
                message: other.to_string(),
            },
        }
    }

    pub fn status(&self, channel_id: &ChannelId) -> RunStatus {
        self.supervisor.status(channel_id)
    }

    pub fn job(&self, channel_id: &ChannelId) -> Option<EncoderJob> {
        self.supervisor.job(channel_id)
    }

    pub fn active_streams(&self) -> Vec<EncoderJob> {
        self.supervisor.active_jobs()
    }

    /// Scenario a monitor connection should preview
    pub async fn preview_scenario(
        &self,
        params: &MonitorParams,
    ) -> Result<ScenarioId, StreamServiceError> {
        let present = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        if let Some(id) = present(&params.scenario_id) {
            return Ok(ScenarioId::new(id));
        }
        let channel_id = present(&params.channel_id)
            .map(ChannelId::new)
            .ok_or(StreamServiceError::MissingIdentifier)?;
        self.directory
            .active_scenario(&channel_id)
            .await?
            .ok_or(StreamServiceError::NoPreviewSource(channel_id))
    }
}
