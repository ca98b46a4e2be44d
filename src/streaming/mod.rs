//! Streaming orchestration core
//!
//! - [`EncoderSupervisor`]: one long-running encoder per channel
//! - [`PreviewMultiplexer`]: one shared preview encoder per scenario
//!
//! Both drive external processes through the [`ProcessLauncher`] seam.

pub mod encoder;
mod error;
pub mod ffmpeg;
pub mod preview;
pub mod process;
pub mod state;

pub use encoder::{EncoderJob, EncoderSupervisor, RunStatus, SourceDescriptor};
pub use error::{PreviewError, ProcessError, SupervisorError};
pub use ffmpeg::{FfmpegSettings, PreviewProfile};
pub use preview::{FeedEvent, FeedHandle, FrameFeed, PreviewMultiplexer};
pub use process::{
    CommandSpec, KillSwitch, ProcessEvent, ProcessExit, ProcessHandle, ProcessLauncher,
    SystemLauncher,
};
pub use state::EncoderState;
