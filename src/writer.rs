use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::db::models::{GameRecord, MoveRecord};
use crate::error::PumpError;
use crate::game::rules::{Position, START_FEN};
use crate::models::{Color, GameStatus, Winner, WriteTask};
use crate::queue::{SharedQueue, DB_WRITE_DEAD_LETTER, DB_WRITE_QUEUE};

const PROCESSING_INTERVAL: Duration = Duration::from_millis(500);
const ERROR_BACKOFF: Duration = Duration::from_secs(2);

/// Spawns the queue forwarder and the single-consumer pump.
pub fn start(queue: SharedQueue, pool: SqlitePool, write_rx: mpsc::UnboundedReceiver<WriteTask>) {
    info!("Starting write-behind persistence pump");
    actix_web::rt::spawn(forward_tasks(queue.clone(), write_rx));
    actix_web::rt::spawn(run_pump(queue, pool));
}

/// Drains the in-process task channel into the shared queue tail. One
/// forwarder per process; the channel and the list are both FIFO, so tasks
/// reach the queue in the exact order the runtime accepted their causing
/// events.
pub async fn forward_tasks(queue: SharedQueue, mut write_rx: mpsc::UnboundedReceiver<WriteTask>) {
    while let Some(task) = write_rx.recv().await {
        let payload = match serde_json::to_string(&task) {
            Ok(payload) => payload,
            Err(err) => {
                error!("failed to encode write task: {}", err);
                continue;
            }
        };
        // Retry until the push lands; giving up here would reorder or drop.
        while let Err(err) = queue.push_back(DB_WRITE_QUEUE, &payload).await {
            warn!("failed to enqueue write task, retrying: {}", err);
            tokio::time::sleep(ERROR_BACKOFF).await;
        }
    }
}

/// The pump loop: drain eagerly while the queue has tasks, poll on a short
/// interval when empty, back off after a failure.
pub async fn run_pump(queue: SharedQueue, pool: SqlitePool) {
    loop {
        match process_next(&queue, &pool).await {
            Ok(true) => {}
            Ok(false) => tokio::time::sleep(PROCESSING_INTERVAL).await,
            Err(err) => {
                error!("persistence pump error: {}", err);
                tokio::time::sleep(ERROR_BACKOFF).await;
            }
        }
    }
}

/// Pops and applies one task. Returns `Ok(true)` when a task was processed.
/// A task that cannot be decoded or applied is moved to the dead-letter
/// list rather than re-enqueued, so one poisoned task cannot wedge the
/// backlog behind it.
pub async fn process_next(queue: &SharedQueue, pool: &SqlitePool) -> Result<bool, PumpError> {
    let Some(payload) = queue.pop_front(DB_WRITE_QUEUE).await? else {
        return Ok(false);
    };

    let outcome = match serde_json::from_str::<WriteTask>(&payload) {
        Ok(task) => apply_task(pool, task).await,
        Err(err) => Err(PumpError::Decode(err)),
    };

    if let Err(err) = outcome {
        queue.push_back(DB_WRITE_DEAD_LETTER, &payload).await?;
        return Err(err);
    }

    Ok(true)
}

async fn apply_task(pool: &SqlitePool, task: WriteTask) -> Result<(), PumpError> {
    match task {
        WriteTask::RecordMove {
            game_id,
            player_id,
            move_number,
            move_san,
            fen_after_move,
            white_time_left,
            black_time_left,
            timestamp,
        } => {
            let id = game_id.to_string();
            MoveRecord::insert(
                pool,
                &id,
                &player_id,
                move_number,
                &move_san,
                &fen_after_move,
                white_time_left,
                black_time_left,
                &timestamp.to_rfc3339(),
            )
            .await?;
            let turn = fen_after_move.split_whitespace().nth(1).unwrap_or("w");
            let updated = GameRecord::refresh_snapshot(
                pool,
                &id,
                &fen_after_move,
                turn,
                white_time_left,
                black_time_left,
                &timestamp.to_rfc3339(),
            )
            .await?;
            if updated == 0 {
                return Err(PumpError::MissingGame(game_id));
            }
            info!("DB writer: saved move {} for game {}", move_number, game_id);
        }

        WriteTask::UpdateStatus {
            game_id,
            status,
            winner,
            reason,
            white_time_left,
            black_time_left,
        } => {
            let id = game_id.to_string();
            let Some(record) = GameRecord::find_by_id(pool, &id).await? else {
                return Err(PumpError::MissingGame(game_id));
            };
            let winner_id = match winner {
                Some(Winner::White) => record.white_player_id.clone(),
                Some(Winner::Black) => record.black_player_id.clone(),
                Some(Winner::Draw) | None => None,
            };
            let pgn = if status == GameStatus::Completed {
                regenerate_movetext(pool, &id).await?
            } else {
                None
            };
            let end_time = status.is_terminal().then(|| Utc::now().to_rfc3339());
            GameRecord::update_status(
                pool,
                &id,
                status.as_str(),
                winner_id.as_deref(),
                pgn.as_deref(),
                white_time_left,
                black_time_left,
                end_time,
            )
            .await?;
            info!(
                "DB writer: game {} -> {} ({})",
                game_id,
                status.as_str(),
                reason
            );
        }

        WriteTask::AssignColor {
            game_id,
            user_id,
            color,
        } => {
            let id = game_id.to_string();
            let updated =
                GameRecord::assign_color(pool, &id, &user_id, color == Color::White).await?;
            if updated == 0 {
                return Err(PumpError::MissingGame(game_id));
            }
            info!(
                "DB writer: assigned {} as {} in game {}",
                user_id,
                color.as_str(),
                game_id
            );
        }

        WriteTask::CreateMatchedGame {
            game_id,
            white_player_id,
            black_player_id,
            time_control,
            initial_time_ms,
        } => {
            let now = Utc::now().to_rfc3339();
            let record = GameRecord {
                id: game_id.to_string(),
                white_player_id: Some(white_player_id),
                black_player_id: Some(black_player_id),
                // Matched games start immediately.
                status: GameStatus::InProgress.as_str().to_string(),
                winner_id: None,
                current_fen: START_FEN.to_string(),
                turn: "w".to_string(),
                time_control: time_control as i64,
                white_time_left: initial_time_ms,
                black_time_left: initial_time_ms,
                last_move_timestamp: Some(now.clone()),
                pgn: None,
                end_time: None,
                created_at: now.clone(),
                updated_at: now,
            };
            record.insert(pool).await?;
            info!("DB writer: created matched game {}", game_id);
        }
    }

    Ok(())
}

/// Rebuilds the numbered movetext by replaying the stored notation through
/// the rules engine. A history that no longer replays cleanly yields no
/// movetext rather than a wrong one.
pub async fn regenerate_movetext(
    pool: &SqlitePool,
    game_id: &str,
) -> Result<Option<String>, PumpError> {
    let moves = MoveRecord::list_for_game(pool, game_id).await?;
    if moves.is_empty() {
        return Ok(None);
    }

    let mut position = Position::start();
    let mut text = String::new();
    for record in &moves {
        let number = position.fullmove();
        let white_to_move = position.side_to_move() == Color::White;
        match position.apply(&record.move_san) {
            Ok(applied) => {
                if white_to_move {
                    text.push_str(&format!("{}. ", number));
                }
                text.push_str(&applied.notation);
                text.push(' ');
            }
            Err(err) => {
                warn!(
                    "failed to replay move {} of game {}: {}",
                    record.move_number, game_id, err
                );
                return Ok(None);
            }
        }
    }

    Ok(Some(text.trim_end().to_string()))
}
