//! Shared fixtures for the integration tests

#![allow(dead_code)]

use actix_web::{dev::ServerHandle, web, App, HttpServer};
use channel_control_service::config::Config;
use channel_control_service::models::{ChannelId, ChannelRecord, ChannelStatus, ScenarioId};
use channel_control_service::repository::InMemoryChannelDirectory;
use channel_control_service::routes;
use channel_control_service::state::AppState;
use channel_control_service::streaming::{
    CommandSpec, KillSwitch, PreviewProfile, ProcessError, ProcessEvent, ProcessExit,
    ProcessHandle, ProcessLauncher,
};
use event_bus::InMemoryEventBus;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Launcher whose processes start immediately and run until killed
#[derive(Default)]
pub struct FakeLauncher {
    launches: AtomicUsize,
    kills: Arc<AtomicUsize>,
    controls: Mutex<Vec<mpsc::Sender<ProcessEvent>>>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// Inject an event into the n-th launched process
    pub async fn emit(&self, index: usize, event: ProcessEvent) {
        let tx = self.controls.lock().unwrap()[index].clone();
        tx.send(event).await.unwrap();
    }

    pub async fn crash(&self, index: usize, reason: &str) {
        self.emit(index, ProcessEvent::Exited(ProcessExit::Failed(reason.to_string())))
            .await;
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, spec: &CommandSpec) -> Result<ProcessHandle, ProcessError> {
        self.launches.fetch_add(1, Ordering::SeqCst);

        let (kill_switch, kill_rx) = KillSwitch::new();
        let (tx, rx) = mpsc::channel(64);
        self.controls.lock().unwrap().push(tx.clone());

        let kills = Arc::clone(&self.kills);
        let command_line = spec.command_line();
        tokio::spawn(async move {
            let _ = tx.send(ProcessEvent::Started { command_line }).await;
            let _ = kill_rx.await;
            kills.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(ProcessEvent::Exited(ProcessExit::Killed)).await;
        });

        Ok(ProcessHandle::new(None, spec.command_line(), kill_switch, rx))
    }
}

pub async fn seeded_directory() -> InMemoryChannelDirectory {
    let directory = InMemoryChannelDirectory::new();
    for (channel, scenario) in [("c1", "s1"), ("c2", "s2")] {
        directory
            .insert_channel(ChannelRecord {
                id: ChannelId::new(channel),
                name: format!("channel {channel}"),
                stream_key: format!("key-{channel}"),
                rtmp_url: None,
                status: ChannelStatus::Idle,
            })
            .await;
        directory
            .insert_scenario(ScenarioId::new(scenario), ChannelId::new(channel), true)
            .await;
    }
    directory
}

pub fn test_config() -> Config {
    Config {
        host: "127.0.0.1".into(),
        port: 0,
        database_url: "postgres://unused".into(),
        database_max_connections: 1,
        redis_url: "redis://unused".into(),
        event_bus_buffer: 64,
        restreamer_url: "rtmp://restreamer/live".into(),
        renderer_url: "http://renderer".into(),
        ffmpeg_path: "ffmpeg".into(),
        preview: PreviewProfile::default(),
        preview_buffer: 16,
    }
}

/// Full app state over the seeded directory, an in-process bus and `launcher`
pub async fn app_state(launcher: Arc<FakeLauncher>) -> AppState {
    AppState::build(
        Arc::new(test_config()),
        Arc::new(seeded_directory().await),
        Arc::new(InMemoryEventBus::new(64)),
        launcher,
    )
}

/// Serve every route on an ephemeral port
pub fn start_server(state: AppState) -> std::io::Result<(SocketAddr, ServerHandle)> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;

    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(routes::configure)
    })
    .workers(1)
    .listen(listener)?
    .run();

    let handle = server.handle();
    actix_rt::spawn(server);
    Ok((addr, handle))
}
