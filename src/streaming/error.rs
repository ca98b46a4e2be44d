use thiserror::Error;

use crate::models::ChannelId;

/// Failure to bring an external process up
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("stream already running for channel {0}")]
    AlreadyRunning(ChannelId),

    #[error("channel {0} has no active scenario")]
    NoActiveSource(ChannelId),

    #[error("no active stream found for channel {0}")]
    NotRunning(ChannelId),

    #[error("stream for channel {0} is still stopping")]
    Stopping(ChannelId),

    #[error("channel id {0} is reserved")]
    ReservedChannel(ChannelId),

    #[error(transparent)]
    Spawn(#[from] ProcessError),
}

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error(transparent)]
    Spawn(#[from] ProcessError),
}
