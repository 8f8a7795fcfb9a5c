use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A verified user, as resolved from the connection token. Immutable for
/// the life of a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
    pub guest: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Color {
    #[serde(rename = "w")]
    White,
    #[serde(rename = "b")]
    Black,
}

impl Color {
    pub fn opponent(self) -> Self {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Color::White => "w",
            Color::Black => "b",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Color::White => "White",
            Color::Black => "Black",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "w" => Some(Color::White),
            "b" => Some(Color::Black),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameStatus {
    Waiting,
    InProgress,
    Completed,
    Aborted,
}

impl GameStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GameStatus::Waiting => "WAITING",
            GameStatus::InProgress => "IN_PROGRESS",
            GameStatus::Completed => "COMPLETED",
            GameStatus::Aborted => "ABORTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WAITING" => Some(GameStatus::Waiting),
            "IN_PROGRESS" => Some(GameStatus::InProgress),
            "COMPLETED" => Some(GameStatus::Completed),
            "ABORTED" => Some(GameStatus::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, GameStatus::Completed | GameStatus::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Winner {
    #[serde(rename = "w")]
    White,
    #[serde(rename = "b")]
    Black,
    #[serde(rename = "draw")]
    Draw,
}

impl From<Color> for Winner {
    fn from(color: Color) -> Self {
        match color {
            Color::White => Winner::White,
            Color::Black => Winner::Black,
        }
    }
}

/// One entry of the move history as sent in the full-state snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveSummary {
    pub number: i64,
    pub san: String,
    pub player_id: String,
    pub white_time_left: i64,
    pub black_time_left: i64,
}

/// Authoritative snapshot of one session, sent to a joining connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullGameState {
    pub id: Uuid,
    pub fen: String,
    pub turn: Color,
    pub white_player_id: Option<String>,
    pub black_player_id: Option<String>,
    pub white_player_name: Option<String>,
    pub black_player_name: Option<String>,
    pub status: GameStatus,
    pub winner: Option<Winner>,
    pub time_control: u32,
    pub white_time_left: i64,
    pub black_time_left: i64,
    pub moves: Vec<MoveSummary>,
}

/// Commands a client may send over the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientCommand {
    #[serde(rename_all = "camelCase")]
    JoinGame { game_id: Uuid },
    #[serde(rename_all = "camelCase")]
    MakeMove {
        game_id: Uuid,
        #[serde(rename = "move")]
        mv: String,
    },
    #[serde(rename_all = "camelCase")]
    FindMatch { time_control: u32 },
    #[serde(rename_all = "camelCase")]
    ChatMessage { game_id: Uuid, text: String },
    /// Opaque peer-signaling payload, relayed to the other connections of
    /// the session without interpretation.
    #[serde(rename_all = "camelCase")]
    Signal { game_id: Uuid, data: serde_json::Value },
}

/// Events the server pushes to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    ConnectionAck { message: String },
    FullGameState(FullGameState),
    #[serde(rename_all = "camelCase")]
    GameStateUpdate {
        game_id: Uuid,
        current_fen: String,
        turn: Color,
        white_time_left: i64,
        black_time_left: i64,
        last_move_san: String,
        status: GameStatus,
    },
    #[serde(rename_all = "camelCase")]
    TimerUpdate {
        game_id: Uuid,
        white_time_left: i64,
        black_time_left: i64,
    },
    #[serde(rename_all = "camelCase")]
    GameOver {
        game_id: Uuid,
        winner: Winner,
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    MatchFound {
        game_id: Uuid,
        opponent_name: String,
        color: Color,
    },
    #[serde(rename_all = "camelCase")]
    UserJoined {
        game_id: Uuid,
        user_id: String,
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    UserLeft { game_id: Uuid, user_id: String },
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        game_id: Uuid,
        user_id: String,
        name: String,
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Signal {
        game_id: Uuid,
        user_id: String,
        data: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    Error { message: String },
}

/// Durable-write backlog entries. Enqueued in the exact order their causing
/// events were accepted; the pump applies them in that order per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteTask {
    #[serde(rename = "CREATE_MOVE", rename_all = "camelCase")]
    RecordMove {
        game_id: Uuid,
        player_id: String,
        move_number: i64,
        move_san: String,
        fen_after_move: String,
        white_time_left: i64,
        black_time_left: i64,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "UPDATE_GAME_STATUS", rename_all = "camelCase")]
    UpdateStatus {
        game_id: Uuid,
        status: GameStatus,
        winner: Option<Winner>,
        reason: String,
        white_time_left: i64,
        black_time_left: i64,
    },
    #[serde(rename = "ASSIGN_PLAYER", rename_all = "camelCase")]
    AssignColor {
        game_id: Uuid,
        user_id: String,
        color: Color,
    },
    #[serde(rename = "CREATE_MATCHED_GAME", rename_all = "camelCase")]
    CreateMatchedGame {
        game_id: Uuid,
        white_player_id: String,
        black_player_id: String,
        time_control: u32,
        initial_time_ms: i64,
    },
}
