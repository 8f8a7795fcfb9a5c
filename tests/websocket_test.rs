use std::time::Duration;

use actix::Actor;
use actix_web::{web, App};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use gambit_server::auth;
use gambit_server::config::Config;
use gambit_server::db::models::{GameRecord, UserRecord};
use gambit_server::game::manager::GameManager;
use gambit_server::game::rules::START_FEN;
use gambit_server::handlers::ws_handler;
use gambit_server::matchmaking::sweep_bucket;
use gambit_server::models::{
    Color, GameStatus, Identity, ServerEvent, WriteTask,
};
use gambit_server::queue::{matchmaking_queue_name, SharedQueue};
use gambit_server::registry::ConnectionRegistry;

type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
type WsWrite = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const TEST_SECRET: &str = "test-secret";

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

fn token_for(id: &str, name: &str) -> String {
    auth::issue_token(
        &Identity {
            id: id.to_string(),
            name: name.to_string(),
            guest: false,
        },
        TEST_SECRET,
        3600,
    )
    .expect("Failed to issue token")
}

struct TestServer {
    srv: actix_test::TestServer,
    pool: SqlitePool,
    queue: SharedQueue,
    connections: ConnectionRegistry,
    write_rx: mpsc::UnboundedReceiver<WriteTask>,
}

async fn start_server(tag: &str) -> TestServer {
    let pool = setup_pool(tag).await;
    let queue = SharedQueue::memory();
    let connections = ConnectionRegistry::new();
    let (write_tx, write_rx) = mpsc::unbounded_channel();
    let game_manager = GameManager::new(pool.clone(), write_tx).start();
    let config = Config {
        port: 0,
        database_url: String::new(),
        redis_url: String::new(),
        jwt_secret: TEST_SECRET.to_string(),
    };

    let queue_data = queue.clone();
    let connections_data = connections.clone();
    let srv = actix_test::start(move || {
        App::new()
            .app_data(web::Data::new(queue_data.clone()))
            .app_data(web::Data::new(connections_data.clone()))
            .app_data(web::Data::new(game_manager.clone()))
            .app_data(web::Data::new(config.clone()))
            .route("/ws", web::get().to(ws_handler))
    });

    TestServer {
        srv,
        pool,
        queue,
        connections,
        write_rx,
    }
}

async fn connect(srv: &actix_test::TestServer, token: &str) -> (WsWrite, WsRead) {
    let url = format!("ws://127.0.0.1:{}/ws?token={}", srv.addr().port(), token);
    let (stream, _) = connect_async(&url).await.expect("Failed to connect");
    stream.split()
}

async fn next_server_event(read: &mut WsRead) -> ServerEvent {
    loop {
        let msg = timeout(Duration::from_secs(3), read.next())
            .await
            .expect("timed out waiting for server event")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("unparseable server event");
        }
    }
}

async fn wait_for_event<F>(read: &mut WsRead, pred: F) -> ServerEvent
where
    F: Fn(&ServerEvent) -> bool,
{
    loop {
        let event = next_server_event(read).await;
        if pred(&event) {
            return event;
        }
    }
}

async fn seed_waiting_game(pool: &SqlitePool, time_control: i64) -> Uuid {
    let game_id = Uuid::new_v4();
    let now = Utc::now().to_rfc3339();
    GameRecord {
        id: game_id.to_string(),
        white_player_id: None,
        black_player_id: None,
        status: "WAITING".to_string(),
        winner_id: None,
        current_fen: START_FEN.to_string(),
        turn: "w".to_string(),
        time_control,
        white_time_left: time_control * 1000,
        black_time_left: time_control * 1000,
        last_move_timestamp: None,
        pgn: None,
        end_time: None,
        created_at: now.clone(),
        updated_at: now,
    }
    .insert(pool)
    .await
    .expect("Failed to insert game");
    game_id
}

#[actix_rt::test]
async fn refuses_handshake_without_valid_token() {
    let server = start_server("ws_auth").await;
    let port = server.srv.addr().port();

    let no_token = format!("ws://127.0.0.1:{}/ws", port);
    assert!(connect_async(&no_token).await.is_err());

    let bad_token = format!("ws://127.0.0.1:{}/ws?token=not-a-jwt", port);
    assert!(connect_async(&bad_token).await.is_err());

    // Nothing reached the registries.
    assert!(server.connections.is_empty());
}

#[actix_rt::test]
async fn join_and_move_flow_over_the_socket() {
    let server = start_server("ws_flow").await;
    UserRecord::new("alice".to_string(), "Alice".to_string(), false)
        .insert(&server.pool)
        .await
        .unwrap();
    UserRecord::new("bob".to_string(), "Bob".to_string(), false)
        .insert(&server.pool)
        .await
        .unwrap();
    let game_id = seed_waiting_game(&server.pool, 60).await;

    let (mut write1, mut read1) = connect(&server.srv, &token_for("alice", "Alice")).await;
    wait_for_event(&mut read1, |e| matches!(e, ServerEvent::ConnectionAck { .. })).await;

    let join = json!({ "type": "JOIN_GAME", "payload": { "gameId": game_id } });
    write1
        .send(Message::Text(join.to_string().into()))
        .await
        .unwrap();
    let ServerEvent::FullGameState(state) =
        wait_for_event(&mut read1, |e| matches!(e, ServerEvent::FullGameState(_))).await
    else {
        unreachable!()
    };
    assert_eq!(state.status, GameStatus::Waiting);
    assert_eq!(state.white_player_id.as_deref(), Some("alice"));

    let (mut write2, mut read2) = connect(&server.srv, &token_for("bob", "Bob")).await;
    wait_for_event(&mut read2, |e| matches!(e, ServerEvent::ConnectionAck { .. })).await;
    write2
        .send(Message::Text(join.to_string().into()))
        .await
        .unwrap();
    let ServerEvent::FullGameState(state) =
        wait_for_event(&mut read2, |e| matches!(e, ServerEvent::FullGameState(_))).await
    else {
        unreachable!()
    };
    assert_eq!(state.status, GameStatus::InProgress);
    assert_eq!(state.black_player_id.as_deref(), Some("bob"));
    assert_eq!(state.white_time_left, 60_000);

    let ServerEvent::UserJoined { user_id, .. } =
        wait_for_event(&mut read1, |e| matches!(e, ServerEvent::UserJoined { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(user_id, "bob");

    // White (the first joiner) plays the opening move; both sockets see it.
    let mv = json!({ "type": "MAKE_MOVE", "payload": { "gameId": game_id, "move": "e4" } });
    write1
        .send(Message::Text(mv.to_string().into()))
        .await
        .unwrap();
    for read in [&mut read1, &mut read2] {
        let ServerEvent::GameStateUpdate {
            turn,
            last_move_san,
            white_time_left,
            ..
        } = wait_for_event(read, |e| matches!(e, ServerEvent::GameStateUpdate { .. })).await
        else {
            unreachable!()
        };
        assert_eq!(turn, Color::Black);
        assert_eq!(last_move_san, "e4");
        assert!(white_time_left <= 60_000 && white_time_left > 58_000);
    }
}

#[actix_rt::test]
async fn find_match_notifies_both_players_within_one_sweep() {
    let server = start_server("ws_match").await;
    let (write_tx, mut write_rx) = mpsc::unbounded_channel();

    let (mut write1, mut read1) = connect(&server.srv, &token_for("x", "Xavier")).await;
    let (mut write2, mut read2) = connect(&server.srv, &token_for("y", "Yvonne")).await;
    wait_for_event(&mut read1, |e| matches!(e, ServerEvent::ConnectionAck { .. })).await;
    wait_for_event(&mut read2, |e| matches!(e, ServerEvent::ConnectionAck { .. })).await;

    let find = json!({ "type": "FIND_MATCH", "payload": { "timeControl": 300 } });
    write1
        .send(Message::Text(find.to_string().into()))
        .await
        .unwrap();
    write2
        .send(Message::Text(find.to_string().into()))
        .await
        .unwrap();

    // Wait for both identities to land in the bucket, then run one sweep.
    let bucket = matchmaking_queue_name(300);
    for _ in 0..30 {
        if server.queue.len(&bucket).await.unwrap() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(server.queue.len(&bucket).await.unwrap(), 2);
    sweep_bucket(300, &server.queue, &server.connections, &write_tx)
        .await
        .unwrap();

    let ServerEvent::MatchFound {
        game_id: game_x,
        color: color_x,
        ..
    } = wait_for_event(&mut read1, |e| matches!(e, ServerEvent::MatchFound { .. })).await
    else {
        unreachable!()
    };
    let ServerEvent::MatchFound {
        game_id: game_y,
        color: color_y,
        ..
    } = wait_for_event(&mut read2, |e| matches!(e, ServerEvent::MatchFound { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(game_x, game_y);
    assert_eq!(color_y, color_x.opponent());
    assert!(matches!(
        write_rx.try_recv(),
        Ok(WriteTask::CreateMatchedGame { .. })
    ));

    // Unsupported time controls are refused before they reach a bucket.
    let odd = json!({ "type": "FIND_MATCH", "payload": { "timeControl": 42 } });
    write1
        .send(Message::Text(odd.to_string().into()))
        .await
        .unwrap();
    let ServerEvent::Error { message } =
        wait_for_event(&mut read1, |e| matches!(e, ServerEvent::Error { .. })).await
    else {
        unreachable!()
    };
    assert_eq!(message, "Unsupported time control.");
}

#[actix_rt::test]
async fn duplicate_identity_connection_is_closed_with_policy_code() {
    let server = start_server("ws_evict").await;

    let (_write1, mut read1) = connect(&server.srv, &token_for("alice", "Alice")).await;
    wait_for_event(&mut read1, |e| matches!(e, ServerEvent::ConnectionAck { .. })).await;

    let (_write2, mut read2) = connect(&server.srv, &token_for("alice", "Alice")).await;
    wait_for_event(&mut read2, |e| matches!(e, ServerEvent::ConnectionAck { .. })).await;

    // The first socket is closed by the registry eviction.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match timeout(remaining, read1.next()).await {
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) => break,
            Err(_) => panic!("first connection was not closed"),
        }
    }

    // Only the new connection remains registered.
    assert_eq!(server.connections.len(), 1);
    assert!(server.connections.lookup("alice").is_some());
    drop(server.write_rx);
}

#[actix_rt::test]
async fn malformed_messages_get_an_error_without_disconnect() {
    let server = start_server("ws_proto").await;

    let (mut write1, mut read1) = connect(&server.srv, &token_for("alice", "Alice")).await;
    wait_for_event(&mut read1, |e| matches!(e, ServerEvent::ConnectionAck { .. })).await;

    write1
        .send(Message::Text("{not json".to_string().into()))
        .await
        .unwrap();
    let ServerEvent::Error { message } =
        wait_for_event(&mut read1, |e| matches!(e, ServerEvent::Error { .. })).await
    else {
        unreachable!()
    };
    assert!(message.starts_with("Invalid message format"));

    // The connection survived the protocol error.
    write1
        .send(Message::Ping(vec![].into()))
        .await
        .unwrap();
    let pong = timeout(Duration::from_secs(3), read1.next())
        .await
        .expect("timed out")
        .expect("socket closed")
        .expect("socket error");
    assert!(matches!(pong, Message::Pong(_)));
}
