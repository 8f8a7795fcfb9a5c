use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use uuid::Uuid;

use gambit_server::db::models::{GameRecord, MoveRecord, UserRecord};
use gambit_server::game::rules::Position;
use gambit_server::models::{Color, GameStatus, Winner, WriteTask};
use gambit_server::queue::{SharedQueue, DB_WRITE_DEAD_LETTER, DB_WRITE_QUEUE};
use gambit_server::writer::{forward_tasks, process_next, regenerate_movetext};

async fn setup_pool(tag: &str) -> SqlitePool {
    let db_path = std::env::temp_dir().join(format!("test_{}_{}.db", tag, Uuid::new_v4()));
    let db_url = format!("sqlite:{}?mode=rwc", db_path.to_str().unwrap());
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .expect("Failed to create test database pool");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

async fn seed_users(pool: &SqlitePool) {
    UserRecord::new("alice".to_string(), "Alice".to_string(), false)
        .insert(pool)
        .await
        .unwrap();
    UserRecord::new("bob".to_string(), "Bob".to_string(), false)
        .insert(pool)
        .await
        .unwrap();
}

async fn push_task(queue: &SharedQueue, task: &WriteTask) {
    let payload = serde_json::to_string(task).unwrap();
    queue.push_back(DB_WRITE_QUEUE, &payload).await.unwrap();
}

fn create_matched(game_id: Uuid) -> WriteTask {
    WriteTask::CreateMatchedGame {
        game_id,
        white_player_id: "alice".to_string(),
        black_player_id: "bob".to_string(),
        time_control: 60,
        initial_time_ms: 60_000,
    }
}

#[actix_rt::test]
async fn applies_a_session_lifecycle_in_order() {
    let pool = setup_pool("pump").await;
    seed_users(&pool).await;
    let queue = SharedQueue::memory();

    let game_id = Uuid::new_v4();
    let mut position = Position::start();
    let applied = position.apply("e4").unwrap();

    push_task(&queue, &create_matched(game_id)).await;
    push_task(
        &queue,
        &WriteTask::RecordMove {
            game_id,
            player_id: "alice".to_string(),
            move_number: 1,
            move_san: "e4".to_string(),
            fen_after_move: applied.fen_after.clone(),
            white_time_left: 59_500,
            black_time_left: 60_000,
            timestamp: Utc::now(),
        },
    )
    .await;
    push_task(
        &queue,
        &WriteTask::UpdateStatus {
            game_id,
            status: GameStatus::Completed,
            winner: Some(Winner::White),
            reason: "Checkmate! alice wins.".to_string(),
            white_time_left: 59_500,
            black_time_left: 60_000,
        },
    )
    .await;

    assert!(process_next(&queue, &pool).await.unwrap());
    assert!(process_next(&queue, &pool).await.unwrap());
    assert!(process_next(&queue, &pool).await.unwrap());
    assert!(!process_next(&queue, &pool).await.unwrap());

    let record = GameRecord::find_by_id(&pool, &game_id.to_string())
        .await
        .unwrap()
        .expect("game row created");
    assert_eq!(record.status, "COMPLETED");
    assert_eq!(record.winner_id.as_deref(), Some("alice"));
    assert_eq!(record.current_fen, applied.fen_after);
    assert_eq!(record.turn, "b");
    assert_eq!(record.white_time_left, 59_500);
    assert_eq!(record.pgn.as_deref(), Some("1. e4"));
    assert!(record.end_time.is_some());

    let moves = MoveRecord::list_for_game(&pool, &game_id.to_string())
        .await
        .unwrap();
    assert_eq!(moves.len(), 1);
    assert_eq!(moves[0].move_san, "e4");
    assert_eq!(moves[0].move_number, 1);
}

#[actix_rt::test]
async fn assign_color_fills_the_requested_slot() {
    let pool = setup_pool("assigncol").await;
    seed_users(&pool).await;
    let queue = SharedQueue::memory();

    let game_id = Uuid::new_v4();
    push_task(&queue, &create_matched(game_id)).await;
    assert!(process_next(&queue, &pool).await.unwrap());

    push_task(
        &queue,
        &WriteTask::AssignColor {
            game_id,
            user_id: "bob".to_string(),
            color: Color::White,
        },
    )
    .await;
    assert!(process_next(&queue, &pool).await.unwrap());

    let record = GameRecord::find_by_id(&pool, &game_id.to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.white_player_id.as_deref(), Some("bob"));
}

#[actix_rt::test]
async fn poisoned_task_is_dead_lettered_and_skipped() {
    let pool = setup_pool("poison").await;
    seed_users(&pool).await;
    let queue = SharedQueue::memory();

    queue
        .push_back(DB_WRITE_QUEUE, "this is not a task")
        .await
        .unwrap();
    let game_id = Uuid::new_v4();
    push_task(&queue, &create_matched(game_id)).await;

    // The malformed payload fails, lands on the dead-letter list, and does
    // not wedge the task behind it.
    assert!(process_next(&queue, &pool).await.is_err());
    assert_eq!(queue.len(DB_WRITE_DEAD_LETTER).await.unwrap(), 1);

    assert!(process_next(&queue, &pool).await.unwrap());
    assert!(GameRecord::find_by_id(&pool, &game_id.to_string())
        .await
        .unwrap()
        .is_some());
}

#[actix_rt::test]
async fn status_update_for_unknown_game_is_dead_lettered() {
    let pool = setup_pool("missing").await;
    let queue = SharedQueue::memory();

    push_task(
        &queue,
        &WriteTask::UpdateStatus {
            game_id: Uuid::new_v4(),
            status: GameStatus::Completed,
            winner: None,
            reason: "Draw by Stalemate!".to_string(),
            white_time_left: 1000,
            black_time_left: 1000,
        },
    )
    .await;

    assert!(process_next(&queue, &pool).await.is_err());
    assert_eq!(queue.len(DB_WRITE_DEAD_LETTER).await.unwrap(), 1);
    assert_eq!(queue.len(DB_WRITE_QUEUE).await.unwrap(), 0);
}

#[actix_rt::test]
async fn forwarder_preserves_enqueue_order() {
    let queue = SharedQueue::memory();
    let (write_tx, write_rx) = mpsc::unbounded_channel();
    actix_rt::spawn(forward_tasks(queue.clone(), write_rx));

    let game_id = Uuid::new_v4();
    let tasks = [
        WriteTask::AssignColor {
            game_id,
            user_id: "alice".to_string(),
            color: Color::White,
        },
        WriteTask::AssignColor {
            game_id,
            user_id: "bob".to_string(),
            color: Color::Black,
        },
        WriteTask::UpdateStatus {
            game_id,
            status: GameStatus::InProgress,
            winner: None,
            reason: "Game started".to_string(),
            white_time_left: 60_000,
            black_time_left: 60_000,
        },
    ];
    for task in &tasks {
        write_tx.send(task.clone()).unwrap();
    }
    drop(write_tx);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    assert_eq!(queue.len(DB_WRITE_QUEUE).await.unwrap(), 3);
    for expected in &tasks {
        let payload = queue.pop_front(DB_WRITE_QUEUE).await.unwrap().unwrap();
        let decoded: WriteTask = serde_json::from_str(&payload).unwrap();
        assert_eq!(
            serde_json::to_value(&decoded).unwrap()["type"],
            serde_json::to_value(expected).unwrap()["type"]
        );
        if let (
            WriteTask::AssignColor { user_id: got, .. },
            WriteTask::AssignColor { user_id: want, .. },
        ) = (&decoded, expected)
        {
            assert_eq!(got, want);
        }
    }
}

#[actix_rt::test]
async fn movetext_numbers_white_moves_only() {
    let pool = setup_pool("movetext").await;
    seed_users(&pool).await;
    let queue = SharedQueue::memory();

    let game_id = Uuid::new_v4();
    push_task(&queue, &create_matched(game_id)).await;
    assert!(process_next(&queue, &pool).await.unwrap());

    let mut position = Position::start();
    for (number, san, player) in [(1, "e4", "alice"), (1, "e5", "bob"), (2, "Nf3", "alice")] {
        let applied = position.apply(san).unwrap();
        MoveRecord::insert(
            &pool,
            &game_id.to_string(),
            player,
            number,
            san,
            &applied.fen_after,
            60_000,
            60_000,
            &Utc::now().to_rfc3339(),
        )
        .await
        .unwrap();
    }

    let text = regenerate_movetext(&pool, &game_id.to_string())
        .await
        .unwrap();
    assert_eq!(text.as_deref(), Some("1. e4 e5 2. Nf3"));
}
