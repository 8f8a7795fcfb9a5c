use thiserror::Error;
use uuid::Uuid;

/// Rejections raised by the session runtime. These are reported to the
/// originating connection only and never mutate session state.
#[derive(Debug, Error)]
pub enum GameStateError {
    #[error("Game not found in active runtime.")]
    UnknownGame,
    #[error("Game not found.")]
    NotPersisted,
    #[error("Game is not in progress.")]
    NotInProgress,
    #[error("Not your turn.")]
    NotYourTurn,
    #[error("You are not a player in this game.")]
    NotAPlayer,
    #[error("Invalid move.")]
    IllegalMove,
    #[error("Failed to load game state.")]
    Load(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Failures inside the persistence pump. A failed task is moved to the
/// dead-letter list; the pump itself keeps draining after a backoff.
#[derive(Debug, Error)]
pub enum PumpError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("malformed task payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("game {0} missing for write task")]
    MissingGame(Uuid),
}
