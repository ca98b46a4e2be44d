use actix::{Actor, ActorContext, AsyncContext, StreamHandler};
use actix_web::{get, web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::models::Topic;
use crate::state::AppState;
use crate::websocket::message_types::{WsOutboundEvent, WsParams};
use crate::websocket::{ConnectionRegistry, RegistryError, SubscriberId};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Control socket bound to one channel topic
struct WsSession {
    topic: Topic,
    subscriber_id: SubscriberId,
    registry: ConnectionRegistry,
    outbound: Option<UnboundedReceiver<String>>,
    inbound: Option<UnboundedSender<String>>,
    hb: Instant,
}

impl WsSession {
    fn new(
        topic: Topic,
        subscriber_id: SubscriberId,
        registry: ConnectionRegistry,
        outbound: UnboundedReceiver<String>,
    ) -> Self {
        Self {
            topic,
            subscriber_id,
            registry,
            outbound: Some(outbound),
            inbound: None,
            hb: Instant::now(),
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                tracing::warn!(topic = %act.topic, "WebSocket heartbeat failed, disconnecting");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    /// Re-publish inbound control messages one at a time, in arrival order
    fn start_inbound_pump(&mut self) {
        let (tx, mut rx) = unbounded_channel::<String>();
        let registry = self.registry.clone();
        let topic = self.topic.clone();
        actix::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = registry.handle_inbound(&topic, &text).await {
                    tracing::error!(topic = %topic, error = %e, "Failed to publish control message");
                }
            }
        });
        self.inbound = Some(tx);
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        tracing::info!(topic = %self.topic, "Control socket connected");
        self.hb(ctx);
        self.start_inbound_pump();
        if let Some(outbound) = self.outbound.take() {
            ctx.add_stream(UnboundedReceiverStream::new(outbound));
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        tracing::info!(topic = %self.topic, "Control socket disconnected");

        // Cleanup: remove subscriber from registry
        self.inbound = None;
        let registry = self.registry.clone();
        let topic = self.topic.clone();
        let subscriber_id = self.subscriber_id;
        actix::spawn(async move {
            registry.unsubscribe(&topic, subscriber_id).await;
        });
    }
}

/// Bus messages for the topic
impl StreamHandler<String> for WsSession {
    fn handle(&mut self, payload: String, ctx: &mut Self::Context) {
        ctx.text(payload);
    }
}

// Handle WebSocket protocol messages
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Ok(ws::Message::Pong(_)) => {
                self.hb = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.hb = Instant::now();
                if let Some(inbound) = &self.inbound {
                    let _ = inbound.send(text.to_string());
                }
            }
            Ok(ws::Message::Binary(_)) => {
                tracing::warn!(topic = %self.topic, "Binary control messages not supported");
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::debug!("WebSocket close message received: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Err(e) => {
                tracing::warn!(topic = %self.topic, error = %e, "WebSocket protocol error");
                ctx.stop();
            }
            _ => {}
        }
    }
}

/// Accepts the upgrade only to close it with a reason
pub(crate) struct RejectSession {
    pub(super) reason: ws::CloseReason,
}

impl RejectSession {
    pub(crate) fn new(code: ws::CloseCode, description: impl Into<String>) -> Self {
        Self {
            reason: ws::CloseReason {
                code,
                description: Some(description.into()),
            },
        }
    }
}

impl Actor for RejectSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        if let Some(message) = &self.reason.description {
            ctx.text(WsOutboundEvent::error(message.as_str()).to_text());
        }
        ctx.close(Some(self.reason.clone()));
        ctx.stop();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RejectSession {
    fn handle(&mut self, _msg: Result<ws::Message, ws::ProtocolError>, _ctx: &mut Self::Context) {}
}

fn rejection(err: &RegistryError) -> RejectSession {
    match err {
        RegistryError::MissingIdentifier => {
            RejectSession::new(ws::CloseCode::Policy, "Missing channelId or scenarioId")
        }
        RegistryError::UnknownScenario(_) => {
            RejectSession::new(ws::CloseCode::Policy, "Scenario not found")
        }
        RegistryError::ReservedChannel(_) => {
            RejectSession::new(ws::CloseCode::Policy, "Invalid channelId")
        }
        RegistryError::Lookup(_) => {
            RejectSession::new(ws::CloseCode::Error, "Internal server error resolving scenario")
        }
        RegistryError::Bus(_) => {
            RejectSession::new(ws::CloseCode::Error, "Event bus unavailable")
        }
    }
}

type Registration = (Topic, SubscriberId, UnboundedReceiver<String>);

async fn register(state: &AppState, params: &WsParams) -> Result<Registration, RegistryError> {
    let descriptor = params.descriptor()?;
    let topic = state.registry.resolve_topic(&descriptor).await?;
    let (subscriber_id, rx) = state.registry.subscribe(&topic).await?;
    Ok((topic, subscriber_id, rx))
}

// HTTP handler
#[get("/ws")]
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    query: web::Query<WsParams>,
) -> Result<HttpResponse, Error> {
    let params = query.into_inner();

    match register(&state, &params).await {
        Ok((topic, subscriber_id, rx)) => {
            let session =
                WsSession::new(topic.clone(), subscriber_id, state.registry.clone(), rx);
            let resp = ws::start(session, &req, stream);
            if resp.is_err() {
                // Handshake failed, the session never started
                state.registry.unsubscribe(&topic, subscriber_id).await;
            }
            resp
        }
        Err(e) => {
            tracing::warn!(error = %e, ?params, "Control socket rejected");
            ws::start(rejection(&e), &req, stream)
        }
    }
}
