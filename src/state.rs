use event_bus::EventBus;
use std::sync::Arc;

use crate::config::Config;
use crate::repository::ChannelDirectory;
use crate::services::{ChannelStreamService, StatusMirror};
use crate::streaming::{EncoderSupervisor, PreviewMultiplexer, ProcessLauncher};
use crate::websocket::ConnectionRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub supervisor: EncoderSupervisor,
    pub streams: ChannelStreamService,
    pub previews: PreviewMultiplexer,
    pub registry: ConnectionRegistry,
}

impl AppState {
    /// Wire the components over shared collaborators
    pub fn build(
        config: Arc<Config>,
        directory: Arc<dyn ChannelDirectory>,
        bus: Arc<dyn EventBus>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        let supervisor =
            EncoderSupervisor::new(launcher.clone(), bus.clone(), config.ffmpeg_settings());
        let streams = ChannelStreamService::new(
            directory.clone(),
            supervisor.clone(),
            config.restreamer_url.clone(),
        );
        let previews =
            PreviewMultiplexer::new(launcher, config.ffmpeg_settings(), config.preview_buffer);
        let registry = ConnectionRegistry::new(bus.clone(), directory.clone());

        StatusMirror::new(directory, bus).spawn(supervisor.subscribe_status());
        registry.spawn_dispatcher();

        Self {
            config,
            supervisor,
            streams,
            previews,
            registry,
        }
    }

    /// Kill every encoder and preview process
    pub fn shutdown(&self) {
        let encoders = self.supervisor.shutdown();
        let previews = self.previews.shutdown();
        tracing::info!(encoders, previews, "Streaming core drained");
    }
}
