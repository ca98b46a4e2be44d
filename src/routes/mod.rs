pub mod channels;
pub mod monitor;
pub mod wsroute;

use actix_web::web;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(channels::start_stream)
        .service(channels::stop_stream)
        .service(channels::stream_status)
        .service(channels::list_streams)
        .service(monitor::monitor_handler)
        .service(wsroute::ws_handler)
        .route("/health", web::get().to(|| async { "OK" }));
}
