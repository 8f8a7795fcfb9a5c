use std::collections::HashMap;
use std::time::Instant;

use actix::SpawnHandle;
use uuid::Uuid;

use crate::game::rules::Position;
use crate::models::{Color, GameStatus, ServerEvent, Winner};
use crate::registry::ConnectionHandle;

/// In-memory runtime state of one session. Exists in the registry only
/// while at least one connection is attached; reconstructed from the
/// durable snapshot otherwise. Mutated exclusively through the manager's
/// mailbox.
pub struct GameSession {
    pub id: Uuid,
    /// Back-references to attached connections, keyed by connection id.
    pub connections: HashMap<Uuid, ConnectionHandle>,
    pub position: Position,
    pub turn: Color,
    pub white_player_id: Option<String>,
    pub black_player_id: Option<String>,
    pub status: GameStatus,
    pub winner: Option<Winner>,
    /// Seconds per side; fixed at creation, also the matchmaking bucket key.
    pub time_control: u32,
    pub white_time_left: i64,
    pub black_time_left: i64,
    /// Instant the clocks were last settled; all debits are computed from
    /// wall-clock elapsed since here, never from tick counts.
    pub checkpoint: Instant,
    /// Board hashes seen since this runtime was built, for threefold
    /// repetition classification.
    pub position_history: Vec<u64>,
    pub timer: Option<SpawnHandle>,
}

impl GameSession {
    pub fn player_color(&self, user_id: &str) -> Option<Color> {
        if self.white_player_id.as_deref() == Some(user_id) {
            Some(Color::White)
        } else if self.black_player_id.as_deref() == Some(user_id) {
            Some(Color::Black)
        } else {
            None
        }
    }

    pub fn player_id(&self, color: Color) -> Option<&str> {
        match color {
            Color::White => self.white_player_id.as_deref(),
            Color::Black => self.black_player_id.as_deref(),
        }
    }

    pub fn time_left(&self, color: Color) -> i64 {
        match color {
            Color::White => self.white_time_left,
            Color::Black => self.black_time_left,
        }
    }

    pub fn time_left_mut(&mut self, color: Color) -> &mut i64 {
        match color {
            Color::White => &mut self.white_time_left,
            Color::Black => &mut self.black_time_left,
        }
    }

    /// Settles the side-to-move clock against wall time and advances the
    /// checkpoint. Remaining time is clamped at zero.
    pub fn settle_clock(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.checkpoint).as_millis() as i64;
        let turn = self.turn;
        let left = self.time_left_mut(turn);
        *left = (*left - elapsed).max(0);
        self.checkpoint = now;
    }

    /// Records a repetition of the given hash and reports whether the
    /// position has now occurred at least three times.
    pub fn record_position(&mut self, hash: u64) -> bool {
        self.position_history.push(hash);
        self.position_history.iter().filter(|h| **h == hash).count() >= 3
    }

    pub fn broadcast(&self, event: &ServerEvent) {
        for conn in self.connections.values() {
            conn.send(event.clone());
        }
    }

    pub fn broadcast_except(&self, except: Uuid, event: &ServerEvent) {
        for (conn_id, conn) in &self.connections {
            if *conn_id != except {
                conn.send(event.clone());
            }
        }
    }
}
