use actix_web::{get, post, web, HttpResponse};
use serde_json::json;

use crate::error::AppResult;
use crate::models::ChannelId;
use crate::state::AppState;

#[post("/api/channels/{id}/start")]
pub async fn start_stream(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let channel_id = ChannelId::new(path.into_inner());
    let job = state.streams.start(&channel_id).await?;
    Ok(HttpResponse::Ok().json(json!({ "success": true, "job": job })))
}

/// Not running is a normal `success: false` answer
#[post("/api/channels/{id}/stop")]
pub async fn stop_stream(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let channel_id = ChannelId::new(path.into_inner());
    Ok(HttpResponse::Ok().json(state.streams.stop(&channel_id)))
}

#[get("/api/channels/{id}/status")]
pub async fn stream_status(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let channel_id = ChannelId::new(path.into_inner());
    Ok(HttpResponse::Ok().json(json!({
        "channelId": channel_id,
        "status": state.streams.status(&channel_id),
        "job": state.streams.job(&channel_id),
    })))
}

#[get("/api/streams")]
pub async fn list_streams(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.streams.active_streams()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::{ChannelRecord, ChannelStatus};
    use crate::repository::InMemoryChannelDirectory;
    use crate::streaming::process::testing::ScriptedLauncher;
    use crate::streaming::PreviewProfile;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use event_bus::InMemoryEventBus;
    use serde_json::Value;
    use std::sync::Arc;

    fn config() -> Config {
        Config {
            host: "127.0.0.1".into(),
            port: 0,
            database_url: "postgres://unused".into(),
            database_max_connections: 1,
            redis_url: "redis://unused".into(),
            event_bus_buffer: 16,
            restreamer_url: "rtmp://localhost/live".into(),
            renderer_url: "http://localhost:5000".into(),
            ffmpeg_path: "ffmpeg".into(),
            preview: PreviewProfile::default(),
            preview_buffer: 8,
        }
    }

    async fn state() -> AppState {
        let directory = InMemoryChannelDirectory::new();
        directory
            .insert_channel(ChannelRecord {
                id: "c1".into(),
                name: "main".into(),
                stream_key: "key1".into(),
                rtmp_url: None,
                status: ChannelStatus::Idle,
            })
            .await;
        directory.insert_scenario("s1".into(), "c1".into(), true).await;

        AppState::build(
            Arc::new(config()),
            Arc::new(directory),
            Arc::new(InMemoryEventBus::new(16)),
            ScriptedLauncher::new(),
        )
    }

    #[actix_rt::test]
    async fn test_start_status_stop_over_http() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state().await))
                .service(start_stream)
                .service(stop_stream)
                .service(stream_status)
                .service(list_streams),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/channels/c1/start")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["job"]["destinationUrl"], "rtmp://localhost/live/key1");

        let req = test::TestRequest::get()
            .uri("/api/channels/c1/status")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "RUNNING");

        let req = test::TestRequest::get().uri("/api/streams").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body.as_array().map(Vec::len), Some(1));

        let req = test::TestRequest::post()
            .uri("/api/channels/c1/start")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let req = test::TestRequest::post()
            .uri("/api/channels/c1/stop")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["success"], true);

        let req = test::TestRequest::post()
            .uri("/api/channels/c1/stop")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "No active stream found");

        let req = test::TestRequest::get()
            .uri("/api/channels/c1/status")
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "IDLE");
        assert!(body["job"].is_null());
    }

    #[actix_rt::test]
    async fn test_unknown_channel_is_404() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state().await))
                .service(start_stream),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/api/channels/ghost/start")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
