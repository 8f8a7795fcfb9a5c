use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::models::Winner;

/// Row of the `users` table. Rows are created by the auth service; the
/// coordinator only reads names and, in tests, seeds fixtures.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub is_guest: i64,
    pub created_at: String,
}

impl UserRecord {
    pub fn new(id: String, name: String, is_guest: bool) -> Self {
        Self {
            id,
            name,
            is_guest: is_guest as i64,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    pub async fn insert(&self, pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO users (id, name, is_guest, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&self.id)
        .bind(&self.name)
        .bind(self.is_guest)
        .bind(&self.created_at)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn find_name(pool: &SqlitePool, id: &str) -> Result<Option<String>, sqlx::Error> {
        let name = sqlx::query_scalar::<_, String>("SELECT name FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;

        Ok(name)
    }
}

/// Row of the `games` table: the durable session snapshot.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct GameRecord {
    pub id: String,
    pub white_player_id: Option<String>,
    pub black_player_id: Option<String>,
    pub status: String,
    pub winner_id: Option<String>,
    pub current_fen: String,
    pub turn: String,
    pub time_control: i64,
    pub white_time_left: i64,
    pub black_time_left: i64,
    pub last_move_timestamp: Option<String>,
    pub pgn: Option<String>,
    pub end_time: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl GameRecord {
    pub async fn insert(&self, pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO games (
                id, white_player_id, black_player_id, status, winner_id,
                current_fen, turn, time_control, white_time_left, black_time_left,
                last_move_timestamp, pgn, end_time, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&self.id)
        .bind(&self.white_player_id)
        .bind(&self.black_player_id)
        .bind(&self.status)
        .bind(&self.winner_id)
        .bind(&self.current_fen)
        .bind(&self.turn)
        .bind(self.time_control)
        .bind(self.white_time_left)
        .bind(self.black_time_left)
        .bind(&self.last_move_timestamp)
        .bind(&self.pgn)
        .bind(&self.end_time)
        .bind(&self.created_at)
        .bind(&self.updated_at)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> Result<Option<Self>, sqlx::Error> {
        let record = sqlx::query_as::<_, GameRecord>("SELECT * FROM games WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;

        Ok(record)
    }

    /// The read-session-with-history operation: game row, player names and
    /// ordered move history in one loaded bundle.
    pub async fn find_with_details(
        pool: &SqlitePool,
        id: &str,
    ) -> Result<Option<GameWithDetails>, sqlx::Error> {
        let Some(game) = Self::find_by_id(pool, id).await? else {
            return Ok(None);
        };

        let white_name = match &game.white_player_id {
            Some(id) => UserRecord::find_name(pool, id).await?,
            None => None,
        };
        let black_name = match &game.black_player_id {
            Some(id) => UserRecord::find_name(pool, id).await?,
            None => None,
        };
        let moves = MoveRecord::list_for_game(pool, id).await?;

        Ok(Some(GameWithDetails {
            game,
            white_name,
            black_name,
            moves,
        }))
    }

    pub async fn assign_color(
        pool: &SqlitePool,
        game_id: &str,
        user_id: &str,
        white: bool,
    ) -> Result<u64, sqlx::Error> {
        let column = if white {
            "white_player_id"
        } else {
            "black_player_id"
        };
        let result = sqlx::query(&format!(
            "UPDATE games SET {column} = ?, updated_at = ? WHERE id = ?"
        ))
        .bind(user_id)
        .bind(Utc::now().to_rfc3339())
        .bind(game_id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn update_status(
        pool: &SqlitePool,
        game_id: &str,
        status: &str,
        winner_id: Option<&str>,
        pgn: Option<&str>,
        white_time_left: i64,
        black_time_left: i64,
        end_time: Option<String>,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE games
            SET status = ?, winner_id = ?, pgn = ?,
                white_time_left = ?, black_time_left = ?,
                end_time = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status)
        .bind(winner_id)
        .bind(pgn)
        .bind(white_time_left)
        .bind(black_time_left)
        .bind(end_time)
        .bind(Utc::now().to_rfc3339())
        .bind(game_id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Refreshes the cached position and clocks after a recorded move.
    pub async fn refresh_snapshot(
        pool: &SqlitePool,
        game_id: &str,
        fen: &str,
        turn: &str,
        white_time_left: i64,
        black_time_left: i64,
        last_move_timestamp: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE games
            SET current_fen = ?, turn = ?, white_time_left = ?, black_time_left = ?,
                last_move_timestamp = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(fen)
        .bind(turn)
        .bind(white_time_left)
        .bind(black_time_left)
        .bind(last_move_timestamp)
        .bind(Utc::now().to_rfc3339())
        .bind(game_id)
        .execute(pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Row of the `moves` table.
#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct MoveRecord {
    pub id: i64,
    pub game_id: String,
    pub player_id: String,
    pub move_number: i64,
    pub move_san: String,
    pub fen_after_move: String,
    pub white_time_left: i64,
    pub black_time_left: i64,
    pub timestamp: String,
}

impl MoveRecord {
    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        pool: &SqlitePool,
        game_id: &str,
        player_id: &str,
        move_number: i64,
        move_san: &str,
        fen_after_move: &str,
        white_time_left: i64,
        black_time_left: i64,
        timestamp: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO moves (
                game_id, player_id, move_number, move_san, fen_after_move,
                white_time_left, black_time_left, timestamp
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(game_id)
        .bind(player_id)
        .bind(move_number)
        .bind(move_san)
        .bind(fen_after_move)
        .bind(white_time_left)
        .bind(black_time_left)
        .bind(timestamp)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn list_for_game(
        pool: &SqlitePool,
        game_id: &str,
    ) -> Result<Vec<Self>, sqlx::Error> {
        let moves = sqlx::query_as::<_, MoveRecord>(
            "SELECT * FROM moves WHERE game_id = ? ORDER BY id ASC",
        )
        .bind(game_id)
        .fetch_all(pool)
        .await?;

        Ok(moves)
    }
}

/// A game row joined with player names and its ordered move history.
#[derive(Debug, Clone)]
pub struct GameWithDetails {
    pub game: GameRecord,
    pub white_name: Option<String>,
    pub black_name: Option<String>,
    pub moves: Vec<MoveRecord>,
}

impl GameWithDetails {
    /// Winner classification mirroring the durable record: a winner id
    /// resolves to a color, a completed game without one is a draw.
    pub fn winner(&self) -> Option<Winner> {
        if self.game.status != "COMPLETED" && self.game.status != "ABORTED" {
            return None;
        }
        match &self.game.winner_id {
            Some(id) if self.game.white_player_id.as_deref() == Some(id) => Some(Winner::White),
            Some(id) if self.game.black_player_id.as_deref() == Some(id) => Some(Winner::Black),
            Some(_) => None,
            None if self.game.status == "COMPLETED" => Some(Winner::Draw),
            None => None,
        }
    }

    /// The durable clock checkpoint, when one has been recorded.
    pub fn last_move_at(&self) -> Option<DateTime<Utc>> {
        self.game
            .last_move_timestamp
            .as_deref()
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}
