use serde::{Deserialize, Serialize};

use super::{RegistryError, TopicDescriptor};

/// Query of the control socket: `/ws?channelId=..` or `/ws?scenarioId=..`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsParams {
    pub channel_id: Option<String>,
    pub scenario_id: Option<String>,
}

impl WsParams {
    pub fn descriptor(&self) -> Result<TopicDescriptor, RegistryError> {
        TopicDescriptor::from_parts(self.channel_id.as_deref(), self.scenario_id.as_deref())
    }
}

/// Query of the preview socket: `/ws/monitor?scenarioId=..` or `?channelId=..`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorParams {
    pub scenario_id: Option<String>,
    pub channel_id: Option<String>,
}

/// Sent to the client right before the server closes a socket on its own
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WsOutboundEvent {
    Error { message: String },
}

impl WsOutboundEvent {
    pub fn error(message: impl Into<String>) -> Self {
        WsOutboundEvent::Error {
            message: message.into(),
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
