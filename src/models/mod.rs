pub mod event;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use event::{ChannelNotice, ProgressMetrics, StreamEvent};

/// Identifier of a channel (output pipeline)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Id whose topic would collide with `channel:all`
    pub const RESERVED: &'static str = "all";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn is_reserved(&self) -> bool {
        self.0 == Self::RESERVED
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of a scenario (renderable on-screen content)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScenarioId(String);

impl ScenarioId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScenarioId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Event bus topic
///
/// Per-channel topics are `channel:<id>`; `channel:all` carries data-change
/// notifications for every channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    const PREFIX: &'static str = "channel:";
    const ALL: &'static str = "channel:all";

    pub fn channel(id: &ChannelId) -> Self {
        Self(format!("{}{}", Self::PREFIX, id))
    }

    pub fn all() -> Self {
        Self(Self::ALL.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Topic {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted lifecycle status of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Idle,
    Running,
    Stopped,
    Error,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Idle => "IDLE",
            ChannelStatus::Running => "RUNNING",
            ChannelStatus::Stopped => "STOPPED",
            ChannelStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IDLE" => Some(ChannelStatus::Idle),
            "RUNNING" => Some(ChannelStatus::Running),
            "STOPPED" => Some(ChannelStatus::Stopped),
            "ERROR" => Some(ChannelStatus::Error),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Projection of a persisted channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRecord {
    pub id: ChannelId,
    pub name: String,
    pub stream_key: String,
    /// Destination base; the stream key is appended
    pub rtmp_url: Option<String>,
    pub status: ChannelStatus,
}

impl ChannelRecord {
    /// Full push URL: `<base>/<streamKey>`
    pub fn destination_url(&self, default_base: &str) -> String {
        let base = self
            .rtmp_url
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or(default_base);
        format!("{}/{}", base.trim_end_matches('/'), self.stream_key)
    }
}
