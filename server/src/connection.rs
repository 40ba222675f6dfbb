//! Websocket connection actor.
//!
//! One actor per live connection. Ingress frames are decoded and forwarded
//! to the server task; egress events arrive on a bounded channel and are
//! relayed into the websocket. Malformed frames close the connection.

use actix::{Actor, ActorContext, AsyncContext, Handler, Message, Running, StreamHandler};
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws::{self, CloseCode, CloseReason};
use serde::Deserialize;

use collab_system::{bincode, ClientEnvelope, ServerEvent, SessionId};

use crate::config::ServerConfig;
use crate::server::{ConnectionCommand, ServerTx};

/// Pushed to a connection by the server side.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Registered { session_id: SessionId },
    Egress(ServerEvent),
    Close { reason: CloseIntent },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseIntent {
    Unauthenticated,
    Protocol,
    HeartbeatTimeout,
}

fn close_reason(intent: CloseIntent) -> CloseReason {
    match intent {
        CloseIntent::Unauthenticated => CloseReason {
            code: CloseCode::Policy,
            description: Some("unauthenticated".into()),
        },
        CloseIntent::Protocol => CloseReason {
            code: CloseCode::Invalid,
            description: None,
        },
        CloseIntent::HeartbeatTimeout => CloseReason {
            code: CloseCode::Away,
            description: Some("heartbeat timeout".into()),
        },
    }
}

#[derive(Message)]
#[rtype(result = "()")]
struct ConnectionActorMessage(ConnectionEvent);

#[derive(Clone, Copy)]
enum ActorState {
    AwaitingRegistration,
    Active(SessionId),
}

pub struct ConnectionActor {
    srv_tx: ServerTx,
    token: String,
    outbound_buffer: usize,
    state: ActorState,
}

impl ConnectionActor {
    pub fn new(srv_tx: ServerTx, token: String, outbound_buffer: usize) -> Self {
        Self {
            srv_tx,
            token,
            outbound_buffer,
            state: ActorState::AwaitingRegistration,
        }
    }
}

impl Actor for ConnectionActor {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<ConnectionEvent>(self.outbound_buffer);

        if self
            .srv_tx
            .try_send(ConnectionCommand::Connect {
                token: self.token.clone(),
                tx,
            })
            .is_err()
        {
            log::warn!("server command channel saturated, refusing connection");
            ctx.close(Some(CloseReason {
                code: CloseCode::Again,
                description: None,
            }));
            ctx.stop();
            return;
        }

        let addr = ctx.address().recipient();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                addr.do_send(ConnectionActorMessage(event));
            }
        });
    }

    fn stopping(&mut self, _: &mut Self::Context) -> Running {
        if let ActorState::Active(session_id) = self.state {
            let _ = self
                .srv_tx
                .try_send(ConnectionCommand::Disconnect { session_id });
        }
        Running::Stop
    }
}

/// Ingress
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ConnectionActor {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(payload)) => ctx.pong(&payload),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Binary(bin)) => {
                let ActorState::Active(from) = self.state else {
                    // Nothing is accepted until registration completes.
                    return;
                };
                match bincode::deserialize::<ClientEnvelope>(&bin) {
                    Ok(envelope) => {
                        log::debug!("ingress from {}: {:?}", from, envelope);
                        if self
                            .srv_tx
                            .try_send(ConnectionCommand::Envelope { from, envelope })
                            .is_err()
                        {
                            // Shed this client rather than buffer unboundedly.
                            ctx.close(Some(CloseReason {
                                code: CloseCode::Again,
                                description: None,
                            }));
                            ctx.stop();
                        }
                    }
                    Err(err) => {
                        log::warn!("protocol error from {}: {}", from, err);
                        ctx.close(Some(close_reason(CloseIntent::Protocol)));
                        ctx.stop();
                    }
                }
            }
            Ok(ws::Message::Text(_)) => {
                // Binary-only protocol.
                ctx.close(Some(close_reason(CloseIntent::Protocol)));
                ctx.stop();
            }
            Ok(ws::Message::Close(_)) => ctx.stop(),
            Ok(_) => {}
            Err(err) => {
                log::warn!("websocket error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Egress
impl Handler<ConnectionActorMessage> for ConnectionActor {
    type Result = ();

    fn handle(&mut self, msg: ConnectionActorMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match msg.0 {
            ConnectionEvent::Registered { session_id } => {
                self.state = ActorState::Active(session_id);
                send_event(ctx, &ServerEvent::Connected { session_id });
            }
            ConnectionEvent::Egress(event) => send_event(ctx, &event),
            ConnectionEvent::Close { reason } => {
                ctx.close(Some(close_reason(reason)));
                ctx.stop();
            }
        }
    }
}

fn send_event(ctx: &mut ws::WebsocketContext<ConnectionActor>, event: &ServerEvent) {
    match bincode::serialize(event) {
        Ok(bytes) => ctx.binary(bytes),
        Err(err) => log::error!("failed to encode egress event: {}", err),
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthQuery {
    token: Option<String>,
}

pub async fn ws_index(
    req: HttpRequest,
    stream: web::Payload,
    srv_tx: web::Data<ServerTx>,
    config: web::Data<ServerConfig>,
    query: web::Query<AuthQuery>,
) -> Result<HttpResponse, Error> {
    let token = query.into_inner().token.unwrap_or_default();
    ws::start(
        ConnectionActor::new(srv_tx.get_ref().clone(), token, config.outbound_buffer),
        &req,
        stream,
    )
}
