use actix::{Actor, ActorContext, AsyncContext, StreamHandler};
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::time::{Duration, Instant};

use super::wsroute::RejectSession;
use crate::services::StreamServiceError;
use crate::state::AppState;
use crate::streaming::{FeedEvent, FeedHandle, FrameFeed, PreviewMultiplexer};
use crate::websocket::message_types::{MonitorParams, WsOutboundEvent};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Preview socket: binary mjpeg chunks out, nothing in
struct MonitorSession {
    handle: FeedHandle,
    feed: Option<FrameFeed>,
    previews: PreviewMultiplexer,
    hb: Instant,
}

impl MonitorSession {
    fn new(feed: FrameFeed, previews: PreviewMultiplexer) -> Self {
        Self {
            handle: feed.handle().clone(),
            feed: Some(feed),
            previews,
            hb: Instant::now(),
        }
    }
}

impl Actor for MonitorSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(scenario_id = %self.handle.scenario_id, "Monitor connected");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                tracing::warn!(scenario_id = %act.handle.scenario_id, "Monitor heartbeat failed, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });

        if let Some(feed) = self.feed.take() {
            let (_, frames) = feed.into_stream();
            ctx.add_stream(frames);
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!(scenario_id = %self.handle.scenario_id, "Monitor disconnected");
        self.previews.detach(&self.handle);
    }
}

impl StreamHandler<FeedEvent> for MonitorSession {
    fn handle(&mut self, event: FeedEvent, ctx: &mut Self::Context) {
        match event {
            FeedEvent::Frame(chunk) => ctx.binary(chunk),
            FeedEvent::Error(message) => {
                tracing::warn!(scenario_id = %self.handle.scenario_id, error = %message, "Preview feed failed");
                ctx.text(WsOutboundEvent::error(message.as_str()).to_text());
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Error,
                    description: Some(message),
                }));
                ctx.stop();
            }
        }
    }

    /// Session closed without an error
    fn finished(&mut self, ctx: &mut Self::Context) {
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for MonitorSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                tracing::warn!(scenario_id = %self.handle.scenario_id, error = %e, "Monitor protocol error");
                ctx.stop();
            }
            _ => {}
        }
    }
}

fn rejection(err: &StreamServiceError) -> RejectSession {
    match err {
        StreamServiceError::MissingIdentifier => {
            RejectSession::new(ws::CloseCode::Policy, "Missing channelId or scenarioId")
        }
        StreamServiceError::NoPreviewSource(_) => RejectSession::new(
            ws::CloseCode::Policy,
            "No active scenario found for this channel",
        ),
        other => RejectSession::new(ws::CloseCode::Error, other.to_string()),
    }
}

#[get("/ws/monitor")]
pub async fn monitor_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    query: web::Query<MonitorParams>,
) -> Result<HttpResponse, Error> {
    let params = query.into_inner();

    let scenario_id = match state.streams.preview_scenario(&params).await {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(error = %e, ?params, "Monitor rejected");
            return ws::start(rejection(&e), &req, stream);
        }
    };

    let feed = match state.previews.attach(&scenario_id) {
        Ok(feed) => feed,
        Err(e) => {
            tracing::error!(scenario_id = %scenario_id, error = %e, "Preview attach failed");
            return ws::start(
                RejectSession::new(ws::CloseCode::Error, e.to_string()),
                &req,
                stream,
            );
        }
    };

    let handle = feed.handle().clone();
    let resp = ws::start(MonitorSession::new(feed, state.previews.clone()), &req, stream);
    if resp.is_err() {
        state.previews.detach(&handle);
    }
    resp
}
