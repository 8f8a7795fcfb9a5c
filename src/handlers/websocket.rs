use std::collections::HashMap;
use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth;
use crate::config::Config;
use crate::game::manager::{
    ApplyMove, Detach, GameManager, JoinSession, RelayChat, RelaySignal,
};
use crate::matchmaking;
use crate::models::{ClientCommand, Identity, ServerEvent};
use crate::queue::{SharedQueue, TIME_CONTROLS};
use crate::registry::{ConnectionHandle, ConnectionRegistry, Outbound};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_POLL: Duration = Duration::from_millis(10);

/// One actor per live socket. Commands are parsed here and dispatched to
/// the game manager; outbound events arrive through the connection handle's
/// channel and are flushed to the socket.
pub struct WsSession {
    /// Last heartbeat response.
    hb: Instant,
    conn: ConnectionHandle,
    rx: Option<mpsc::UnboundedReceiver<Outbound>>,
    /// The at-most-one session this connection is attached to.
    game_id: Option<Uuid>,
    connections: ConnectionRegistry,
    queue: SharedQueue,
    game_manager: Addr<GameManager>,
}

impl WsSession {
    pub fn new(
        identity: Identity,
        connections: ConnectionRegistry,
        queue: SharedQueue,
        game_manager: Addr<GameManager>,
    ) -> Self {
        let (conn, rx) = ConnectionHandle::new(identity);
        Self {
            hb: Instant::now(),
            conn,
            rx: Some(rx),
            game_id: None,
            connections,
            queue,
            game_manager,
        }
    }

    fn hb(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    /// Flushes events from the connection channel to the socket. A close
    /// frame here means the registry evicted this connection.
    fn poll_outbound(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(OUTBOUND_POLL, |act, ctx| {
            if let Some(rx) = &mut act.rx {
                while let Ok(frame) = rx.try_recv() {
                    match frame {
                        Outbound::Event(event) => {
                            if let Ok(json) = serde_json::to_string(&event) {
                                ctx.text(json);
                            }
                        }
                        Outbound::Close => {
                            ctx.close(Some(ws::CloseReason {
                                code: ws::CloseCode::Policy,
                                description: Some("Connection superseded".to_string()),
                            }));
                            ctx.stop();
                            return;
                        }
                    }
                }
            }
        });
    }

    fn handle_command(&mut self, cmd: ClientCommand, ctx: &mut ws::WebsocketContext<Self>) {
        match cmd {
            ClientCommand::JoinGame { game_id } => {
                // A connection attaches to at most one session; leave the
                // previous one first.
                if let Some(old) = self.game_id {
                    if old != game_id {
                        self.game_manager.do_send(Detach {
                            game_id: old,
                            conn_id: self.conn.conn_id,
                            user_id: self.conn.identity.id.clone(),
                        });
                    }
                }
                self.game_id = Some(game_id);
                self.game_manager.do_send(JoinSession {
                    game_id,
                    conn: self.conn.clone(),
                });
            }
            ClientCommand::MakeMove { game_id, mv } => {
                self.game_manager.do_send(ApplyMove {
                    game_id,
                    conn: self.conn.clone(),
                    mv,
                });
            }
            ClientCommand::FindMatch { time_control } => {
                if !TIME_CONTROLS.contains(&time_control) {
                    self.conn.send(ServerEvent::Error {
                        message: "Unsupported time control.".to_string(),
                    });
                    return;
                }
                info!(
                    "User {} entering {}s matchmaking queue",
                    self.conn.identity.id, time_control
                );
                let queue = self.queue.clone();
                let user_id = self.conn.identity.id.clone();
                ctx.spawn(
                    async move {
                        if let Err(err) =
                            matchmaking::enter_queue(&queue, time_control, &user_id).await
                        {
                            warn!("failed to enter matchmaking queue: {}", err);
                        }
                    }
                    .into_actor(self),
                );
            }
            ClientCommand::ChatMessage { game_id, text } => {
                self.game_manager.do_send(RelayChat {
                    game_id,
                    conn_id: self.conn.conn_id,
                    user_id: self.conn.identity.id.clone(),
                    name: self.conn.identity.name.clone(),
                    text,
                });
            }
            ClientCommand::Signal { game_id, data } => {
                self.game_manager.do_send(RelaySignal {
                    game_id,
                    conn_id: self.conn.conn_id,
                    user_id: self.conn.identity.id.clone(),
                    data,
                });
            }
        }
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.connections.register(self.conn.clone());
        info!(
            "User connected: {} ({})",
            self.conn.identity.name, self.conn.identity.id
        );
        self.hb(ctx);
        self.poll_outbound(ctx);
        self.conn.send(ServerEvent::ConnectionAck {
            message: "Connected".to_string(),
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Detach is keyed by connection id, so this cannot disturb a newer
        // connection of the same identity.
        if let Some(game_id) = self.game_id {
            self.game_manager.do_send(Detach {
                game_id,
                conn_id: self.conn.conn_id,
                user_id: self.conn.identity.id.clone(),
            });
        }

        if self
            .connections
            .unregister(&self.conn.identity.id, self.conn.conn_id)
        {
            info!("User disconnected: {}", self.conn.identity.id);
            let queue = self.queue.clone();
            let user_id = self.conn.identity.id.clone();
            actix_web::rt::spawn(async move {
                if let Err(err) = matchmaking::purge(&queue, &user_id).await {
                    warn!("failed to purge {} from matchmaking: {}", user_id, err);
                }
            });
        } else {
            info!(
                "Close event for outdated connection of {}; registry untouched",
                self.conn.identity.id
            );
        }
    }
}

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
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(cmd) => self.handle_command(cmd, ctx),
                Err(err) => {
                    warn!(
                        "unparseable message from {}: {}",
                        self.conn.identity.id, err
                    );
                    self.conn.send(ServerEvent::Error {
                        message: format!("Invalid message format: {}", text),
                    });
                }
            },
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            _ => {}
        }
    }
}

/// WebSocket endpoint. The bearer token is resolved to an identity before
/// the upgrade; failures are refused with a policy status and never reach
/// the registries.
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    connections: web::Data<ConnectionRegistry>,
    queue: web::Data<SharedQueue>,
    game_manager: web::Data<Addr<GameManager>>,
    config: web::Data<Config>,
    query: web::Query<HashMap<String, String>>,
) -> Result<HttpResponse, Error> {
    let Some(token) = query.get("token") else {
        return Ok(HttpResponse::Unauthorized().body("Token required"));
    };
    let identity = match auth::verify_token(token, &config.jwt_secret) {
        Ok(identity) => identity,
        Err(err) => {
            warn!("WS auth error: {}", err);
            return Ok(HttpResponse::Unauthorized().body("Invalid token"));
        }
    };

    let session = WsSession::new(
        identity,
        connections.get_ref().clone(),
        queue.get_ref().clone(),
        game_manager.get_ref().clone(),
    );
    ws::start(session, &req, stream)
}
