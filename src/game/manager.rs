use std::collections::HashMap;
use std::time::{Duration, Instant};

use actix::prelude::*;
use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::models::{GameRecord, GameWithDetails};
use crate::error::GameStateError;
use crate::game::rules::{Position, TerminalState};
use crate::game::session::GameSession;
use crate::models::{
    Color, FullGameState, GameStatus, MoveSummary, ServerEvent, Winner, WriteTask,
};
use crate::registry::ConnectionHandle;

/// Clock cadence. Remaining time is recomputed from the checkpoint on every
/// tick, so a delayed tick debits the full elapsed wall time.
const CLOCK_TICK: Duration = Duration::from_secs(1);

/// The sole mutator of session state. Joins, moves, detaches, relays and
/// clock ticks are all serialized through this actor's mailbox; durable
/// snapshot loads are awaited off-mailbox and re-enter it to apply.
pub struct GameManager {
    games: HashMap<Uuid, GameSession>,
    pool: SqlitePool,
    write_tx: mpsc::UnboundedSender<WriteTask>,
}

impl GameManager {
    pub fn new(pool: SqlitePool, write_tx: mpsc::UnboundedSender<WriteTask>) -> Self {
        Self {
            games: HashMap::new(),
            pool,
            write_tx,
        }
    }

    /// Rebuilds the runtime for a session that is not in the registry,
    /// recomputing the side-to-move clock from the durable checkpoint. A
    /// clock that ran out while nobody was connected finalizes immediately.
    fn rebuild_runtime(&mut self, game_id: Uuid, details: &GameWithDetails) -> Result<(), ()> {
        let record = &details.game;
        let position = match Position::from_fen(&record.current_fen) {
            Ok(p) => p,
            Err(err) => {
                warn!("stored position for game {} is unreadable: {}", game_id, err);
                return Err(());
            }
        };
        let turn = Color::parse(&record.turn).unwrap_or_else(|| position.side_to_move());
        let mut status = GameStatus::parse(&record.status).unwrap_or(GameStatus::Waiting);
        let mut winner = details.winner();
        let mut white_ms = record.white_time_left;
        let mut black_ms = record.black_time_left;

        if status == GameStatus::InProgress {
            if let Some(checkpoint) = details.last_move_at() {
                let elapsed = (Utc::now() - checkpoint).num_milliseconds().max(0);
                match turn {
                    Color::White => white_ms -= elapsed,
                    Color::Black => black_ms -= elapsed,
                }
            }
            if white_ms <= 0 || black_ms <= 0 {
                let timed_out = if white_ms <= 0 {
                    Color::White
                } else {
                    Color::Black
                };
                status = GameStatus::Completed;
                winner = Some(Winner::from(timed_out.opponent()));
                white_ms = white_ms.max(0);
                black_ms = black_ms.max(0);
                info!("Game {} timed out for {} on load", game_id, timed_out.label());
                queue_task(
                    &self.write_tx,
                    WriteTask::UpdateStatus {
                        game_id,
                        status,
                        winner,
                        reason: format!("Timeout detected on join for {}", timed_out.label()),
                        white_time_left: white_ms,
                        black_time_left: black_ms,
                    },
                );
            }
            white_ms = white_ms.max(0);
            black_ms = black_ms.max(0);
        }

        let hash = position.hash();
        self.games.insert(
            game_id,
            GameSession {
                id: game_id,
                connections: HashMap::new(),
                position,
                turn,
                white_player_id: record.white_player_id.clone(),
                black_player_id: record.black_player_id.clone(),
                status,
                winner,
                time_control: record.time_control as u32,
                white_time_left: white_ms,
                black_time_left: black_ms,
                checkpoint: Instant::now(),
                position_history: vec![hash],
                timer: None,
            },
        );
        Ok(())
    }

    fn finish_join(
        &mut self,
        msg: JoinSession,
        loaded: Result<Option<GameWithDetails>, sqlx::Error>,
        ctx: &mut Context<Self>,
    ) {
        let game_id = msg.game_id;
        let conn = msg.conn;
        let user_id = conn.identity.id.clone();

        let details = match loaded {
            Ok(Some(details)) => details,
            Ok(None) => {
                send_error(&conn, &GameStateError::NotPersisted);
                return;
            }
            Err(err) => {
                warn!("failed to load game {}: {}", game_id, err);
                send_error(&conn, &GameStateError::Load(err));
                return;
            }
        };

        // Only seated players may enter once the game has left WAITING.
        let record = &details.game;
        if record.status != "WAITING"
            && record.white_player_id.as_deref() != Some(user_id.as_str())
            && record.black_player_id.as_deref() != Some(user_id.as_str())
        {
            send_error(&conn, &GameStateError::NotAPlayer);
            return;
        }

        if !self.games.contains_key(&game_id) && self.rebuild_runtime(game_id, &details).is_err() {
            conn.send(ServerEvent::Error {
                message: "Failed to load game state.".to_string(),
            });
            return;
        }

        let write_tx = self.write_tx.clone();
        let Some(session) = self.games.get_mut(&game_id) else {
            return;
        };

        session.connections.insert(conn.conn_id, conn.clone());
        if session.status == GameStatus::InProgress {
            session.settle_clock();
        }
        info!(
            "User {} joined game {} ({} attached)",
            user_id,
            game_id,
            session.connections.len()
        );

        let mut assigned = None;
        if session.status == GameStatus::Waiting {
            if session.white_player_id.is_none() {
                session.white_player_id = Some(user_id.clone());
                assigned = Some(Color::White);
            } else if session.black_player_id.is_none()
                && session.white_player_id.as_deref() != Some(user_id.as_str())
            {
                session.black_player_id = Some(user_id.clone());
                assigned = Some(Color::Black);
            }
            if let Some(color) = assigned {
                queue_task(
                    &write_tx,
                    WriteTask::AssignColor {
                        game_id,
                        user_id: user_id.clone(),
                        color,
                    },
                );
            }

            if session.white_player_id.is_some() && session.black_player_id.is_some() {
                info!("Game {} starting", game_id);
                session.status = GameStatus::InProgress;
                session.checkpoint = Instant::now();
                queue_task(
                    &write_tx,
                    WriteTask::UpdateStatus {
                        game_id,
                        status: GameStatus::InProgress,
                        winner: None,
                        reason: "Game started".to_string(),
                        white_time_left: session.white_time_left,
                        black_time_left: session.black_time_left,
                    },
                );
            }
        }

        // The joiner gets the full, time-adjusted snapshot; everyone else a
        // join notice.
        let mut white_name = details.white_name.clone();
        let mut black_name = details.black_name.clone();
        match assigned {
            Some(Color::White) => white_name = Some(conn.identity.name.clone()),
            Some(Color::Black) => black_name = Some(conn.identity.name.clone()),
            None => {}
        }
        let full_state = FullGameState {
            id: game_id,
            fen: session.position.fen(),
            turn: session.turn,
            white_player_id: session.white_player_id.clone(),
            black_player_id: session.black_player_id.clone(),
            white_player_name: white_name,
            black_player_name: black_name,
            status: session.status,
            winner: session.winner,
            time_control: session.time_control,
            white_time_left: session.white_time_left,
            black_time_left: session.black_time_left,
            moves: details
                .moves
                .iter()
                .map(|m| MoveSummary {
                    number: m.move_number,
                    san: m.move_san.clone(),
                    player_id: m.player_id.clone(),
                    white_time_left: m.white_time_left,
                    black_time_left: m.black_time_left,
                })
                .collect(),
        };
        conn.send(ServerEvent::FullGameState(full_state));
        session.broadcast_except(
            conn.conn_id,
            &ServerEvent::UserJoined {
                game_id,
                user_id: user_id.clone(),
                name: conn.identity.name.clone(),
            },
        );

        let needs_clock =
            session.status == GameStatus::InProgress && session.timer.is_none();
        if needs_clock {
            self.start_clock(game_id, ctx);
        }
    }

    /// No-op when a timer is already active or the game is not in progress.
    fn start_clock(&mut self, game_id: Uuid, ctx: &mut Context<Self>) {
        let Some(session) = self.games.get_mut(&game_id) else {
            return;
        };
        if session.timer.is_some() || session.status != GameStatus::InProgress {
            return;
        }
        info!("Starting timer for game {}", game_id);
        let handle = ctx.run_interval(CLOCK_TICK, move |act, ctx| act.tick(game_id, ctx));
        session.timer = Some(handle);
    }

    fn tick(&mut self, game_id: Uuid, ctx: &mut Context<Self>) {
        let Some(session) = self.games.get_mut(&game_id) else {
            return;
        };
        if session.status != GameStatus::InProgress {
            stop_clock(session, ctx);
            return;
        }

        session.settle_clock();
        let loser = session.turn;
        if session.time_left(loser) == 0 {
            self.finalize_timeout(game_id, loser, ctx);
        } else {
            let event = ServerEvent::TimerUpdate {
                game_id,
                white_time_left: session.white_time_left,
                black_time_left: session.black_time_left,
            };
            session.broadcast(&event);
        }
    }

    /// Completes the session with the other side as winner, exactly once.
    fn finalize_timeout(&mut self, game_id: Uuid, loser: Color, ctx: &mut Context<Self>) {
        let write_tx = self.write_tx.clone();
        let Some(session) = self.games.get_mut(&game_id) else {
            return;
        };
        if session.status != GameStatus::InProgress {
            return;
        }

        *session.time_left_mut(loser) = 0;
        let winner = Winner::from(loser.opponent());
        session.status = GameStatus::Completed;
        session.winner = Some(winner);
        stop_clock(session, ctx);

        let loser_name = session
            .player_id(loser)
            .unwrap_or(loser.label())
            .to_string();
        let reason = format!("{}'s time ran out", loser_name);
        info!("Game {} ended via timer: {}", game_id, reason);
        queue_task(
            &write_tx,
            WriteTask::UpdateStatus {
                game_id,
                status: GameStatus::Completed,
                winner: Some(winner),
                reason: reason.clone(),
                white_time_left: session.white_time_left,
                black_time_left: session.black_time_left,
            },
        );
        session.broadcast(&ServerEvent::GameOver {
            game_id,
            winner,
            reason,
        });
    }
}

impl Actor for GameManager {
    type Context = Context<Self>;
}

fn stop_clock(session: &mut GameSession, ctx: &mut Context<GameManager>) {
    if let Some(handle) = session.timer.take() {
        ctx.cancel_future(handle);
        info!("Stopped timer for game {}", session.id);
    }
}

fn send_error(conn: &ConnectionHandle, err: &GameStateError) {
    conn.send(ServerEvent::Error {
        message: err.to_string(),
    });
}

fn queue_task(tx: &mpsc::UnboundedSender<WriteTask>, task: WriteTask) {
    if tx.send(task).is_err() {
        warn!("write queue receiver dropped; task lost");
    }
}

/// Attach a connection to a session, loading the durable snapshot when the
/// session is not already live.
#[derive(Message)]
#[rtype(result = "()")]
pub struct JoinSession {
    pub game_id: Uuid,
    pub conn: ConnectionHandle,
}

impl Handler<JoinSession> for GameManager {
    type Result = ResponseActFuture<Self, ()>;

    fn handle(&mut self, msg: JoinSession, _ctx: &mut Context<Self>) -> Self::Result {
        let pool = self.pool.clone();
        let id = msg.game_id.to_string();
        Box::pin(
            async move { GameRecord::find_with_details(&pool, &id).await }
                .into_actor(self)
                .map(move |loaded, act, ctx| act.finish_join(msg, loaded, ctx)),
        )
    }
}

/// A candidate move from a connection.
#[derive(Message)]
#[rtype(result = "()")]
pub struct ApplyMove {
    pub game_id: Uuid,
    pub conn: ConnectionHandle,
    pub mv: String,
}

impl Handler<ApplyMove> for GameManager {
    type Result = ();

    fn handle(&mut self, msg: ApplyMove, ctx: &mut Context<Self>) {
        let user_id = msg.conn.identity.id.clone();
        let write_tx = self.write_tx.clone();

        let Some(session) = self.games.get_mut(&msg.game_id) else {
            send_error(&msg.conn, &GameStateError::UnknownGame);
            return;
        };
        if session.status != GameStatus::InProgress {
            send_error(&msg.conn, &GameStateError::NotInProgress);
            return;
        }
        let Some(color) = session.player_color(&user_id) else {
            send_error(&msg.conn, &GameStateError::NotYourTurn);
            return;
        };
        if color != session.turn {
            send_error(&msg.conn, &GameStateError::NotYourTurn);
            return;
        }

        // Prospective debit; only committed once the move is accepted, so a
        // rejected move leaves the session untouched.
        let now = Instant::now();
        let elapsed = now.duration_since(session.checkpoint).as_millis() as i64;
        let remaining = (session.time_left(color) - elapsed).max(0);
        if remaining == 0 {
            // The flag fell while the mover deliberated.
            session.checkpoint = now;
            self.finalize_timeout(msg.game_id, color, ctx);
            return;
        }

        let mut position = session.position.clone();
        let applied = match position.apply(&msg.mv) {
            Ok(applied) => applied,
            Err(_) => {
                warn!("invalid move from {} in game {}: {}", user_id, msg.game_id, msg.mv);
                send_error(&msg.conn, &GameStateError::IllegalMove);
                return;
            }
        };

        session.position = position;
        *session.time_left_mut(color) = remaining;
        session.turn = applied.turn_after;
        session.checkpoint = now;
        let threefold = session.record_position(applied.position_hash);

        queue_task(
            &write_tx,
            WriteTask::RecordMove {
                game_id: msg.game_id,
                player_id: user_id.clone(),
                move_number: applied.move_number,
                move_san: applied.notation.clone(),
                fen_after_move: applied.fen_after.clone(),
                white_time_left: session.white_time_left,
                black_time_left: session.black_time_left,
                timestamp: Utc::now(),
            },
        );

        let mut game_over = None;
        if let Some(terminal) = session.position.terminal(threefold) {
            let (winner, reason) = match terminal {
                TerminalState::Checkmate => (
                    Winner::from(color),
                    format!("Checkmate! {} wins.", user_id),
                ),
                TerminalState::Draw(draw) => (Winner::Draw, draw.describe().to_string()),
            };
            session.status = GameStatus::Completed;
            session.winner = Some(winner);
            stop_clock(session, ctx);
            info!("Game {} ended: {}", msg.game_id, reason);
            queue_task(
                &write_tx,
                WriteTask::UpdateStatus {
                    game_id: msg.game_id,
                    status: GameStatus::Completed,
                    winner: Some(winner),
                    reason: reason.clone(),
                    white_time_left: session.white_time_left,
                    black_time_left: session.black_time_left,
                },
            );
            game_over = Some((winner, reason));
        }

        session.broadcast(&ServerEvent::GameStateUpdate {
            game_id: msg.game_id,
            current_fen: session.position.fen(),
            turn: session.turn,
            white_time_left: session.white_time_left,
            black_time_left: session.black_time_left,
            last_move_san: applied.notation.clone(),
            status: session.status,
        });
        if let Some((winner, reason)) = game_over {
            session.broadcast(&ServerEvent::GameOver {
                game_id: msg.game_id,
                winner,
                reason,
            });
        }
    }
}

/// Remove a connection from a session. The last detach stops the clock and
/// drops the runtime; the durable record persists independently.
#[derive(Message)]
#[rtype(result = "()")]
pub struct Detach {
    pub game_id: Uuid,
    pub conn_id: Uuid,
    pub user_id: String,
}

impl Handler<Detach> for GameManager {
    type Result = ();

    fn handle(&mut self, msg: Detach, ctx: &mut Context<Self>) {
        let Some(session) = self.games.get_mut(&msg.game_id) else {
            return;
        };
        session.connections.remove(&msg.conn_id);
        if session.connections.is_empty() {
            stop_clock(session, ctx);
            self.games.remove(&msg.game_id);
            info!("Last connection left game {}; dropped runtime", msg.game_id);
        } else {
            session.broadcast(&ServerEvent::UserLeft {
                game_id: msg.game_id,
                user_id: msg.user_id,
            });
        }
    }
}

/// Chat fan-out to the other connections of a session. Broadcast-only, no
/// state involved.
#[derive(Message)]
#[rtype(result = "()")]
pub struct RelayChat {
    pub game_id: Uuid,
    pub conn_id: Uuid,
    pub user_id: String,
    pub name: String,
    pub text: String,
}

impl Handler<RelayChat> for GameManager {
    type Result = ();

    fn handle(&mut self, msg: RelayChat, _ctx: &mut Context<Self>) {
        if let Some(session) = self.games.get(&msg.game_id) {
            session.broadcast_except(
                msg.conn_id,
                &ServerEvent::ChatMessage {
                    game_id: msg.game_id,
                    user_id: msg.user_id,
                    name: msg.name,
                    text: msg.text,
                },
            );
        }
    }
}

/// Opaque signaling fan-out, scoped by session id and not interpreted.
#[derive(Message)]
#[rtype(result = "()")]
pub struct RelaySignal {
    pub game_id: Uuid,
    pub conn_id: Uuid,
    pub user_id: String,
    pub data: serde_json::Value,
}

impl Handler<RelaySignal> for GameManager {
    type Result = ();

    fn handle(&mut self, msg: RelaySignal, _ctx: &mut Context<Self>) {
        if let Some(session) = self.games.get(&msg.game_id) {
            session.broadcast_except(
                msg.conn_id,
                &ServerEvent::Signal {
                    game_id: msg.game_id,
                    user_id: msg.user_id,
                    data: msg.data,
                },
            );
        }
    }
}
