pub mod channel_streams;
pub mod status_mirror;

pub use channel_streams::{ChannelStreamService, StopOutcome, StreamServiceError};
pub use status_mirror::StatusMirror;
