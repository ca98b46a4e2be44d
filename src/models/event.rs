use serde::{Deserialize, Serialize};

use super::{ChannelId, ChannelStatus};

/// Encoder telemetry, forwarded as reported by the encoder
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressMetrics {
    pub frames: Option<u64>,
    pub fps: Option<f64>,
    pub kbps: Option<f64>,
    /// Output size so far, in kB
    pub target_size: Option<u64>,
    /// Encoded media time, `HH:MM:SS.xx`
    pub timemark: Option<String>,
}

/// Lifecycle events published on `channel:<id>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "STREAM_STARTED", rename_all = "camelCase")]
    Started { channel_id: ChannelId },

    #[serde(rename = "STREAM_PROGRESS", rename_all = "camelCase")]
    Progress {
        channel_id: ChannelId,
        metrics: ProgressMetrics,
    },

    #[serde(rename = "STREAM_ERROR", rename_all = "camelCase")]
    Error { channel_id: ChannelId, error: String },

    #[serde(rename = "STREAM_ENDED", rename_all = "camelCase")]
    Ended { channel_id: ChannelId },
}

impl StreamEvent {
    pub fn channel_id(&self) -> &ChannelId {
        match self {
            StreamEvent::Started { channel_id }
            | StreamEvent::Progress { channel_id, .. }
            | StreamEvent::Error { channel_id, .. }
            | StreamEvent::Ended { channel_id } => channel_id,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            StreamEvent::Started { .. } => "STREAM_STARTED",
            StreamEvent::Progress { .. } => "STREAM_PROGRESS",
            StreamEvent::Error { .. } => "STREAM_ERROR",
            StreamEvent::Ended { .. } => "STREAM_ENDED",
        }
    }

    /// Persisted status this event implies, if any
    pub fn implied_status(&self) -> Option<ChannelStatus> {
        match self {
            StreamEvent::Started { .. } => Some(ChannelStatus::Running),
            StreamEvent::Progress { .. } => None,
            StreamEvent::Error { .. } => Some(ChannelStatus::Error),
            StreamEvent::Ended { .. } => Some(ChannelStatus::Stopped),
        }
    }
}

/// Data-change notifications published on `channel:all`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChannelNotice {
    #[serde(rename = "CHANNEL_STATUS_CHANGED", rename_all = "camelCase")]
    StatusChanged {
        channel_id: ChannelId,
        status: ChannelStatus,
    },
}
