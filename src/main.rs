use actix_web::{web, App, HttpServer};
use channel_control_service::{
    config, db, error, logging,
    repository::PgChannelDirectory,
    routes,
    state::AppState,
    streaming::SystemLauncher,
};
use event_bus::RedisEventBus;
use std::sync::Arc;

#[actix_web::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = Arc::new(config::Config::from_env()?);

    let pool = db::init_pool(&cfg.database_url, cfg.database_max_connections)
        .await
        .map_err(|e| error::AppError::StartServer(format!("db: {e}")))?;

    let bus = RedisEventBus::connect(&cfg.redis_url, cfg.event_bus_buffer)
        .await
        .map_err(|e| error::AppError::StartServer(format!("redis: {e}")))?;

    let state = AppState::build(
        cfg.clone(),
        Arc::new(PgChannelDirectory::new(pool)),
        Arc::new(bus),
        Arc::new(SystemLauncher::new()),
    );

    let bind_addr = cfg.bind_addr();
    tracing::info!(%bind_addr, "starting channel-control-service");

    let rest_state = state.clone();
    let result = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(rest_state.clone()))
            .configure(routes::configure)
    })
    .bind(&bind_addr)
    .map_err(|e| error::AppError::StartServer(format!("bind: {e}")))?
    .run()
    .await
    .map_err(|e| error::AppError::StartServer(format!("server: {e}")));

    state.shutdown();
    result
}
