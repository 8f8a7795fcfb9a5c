use actix::Actor;
use actix_web::{web, App, HttpServer};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gambit_server::config::Config;
use gambit_server::db;
use gambit_server::game::manager::GameManager;
use gambit_server::handlers::ws_handler;
use gambit_server::matchmaking;
use gambit_server::queue::SharedQueue;
use gambit_server::registry::ConnectionRegistry;
use gambit_server::writer;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();

    let pool = db::init_db(&config.database_url)
        .await
        .expect("Failed to initialize database");
    let queue = SharedQueue::redis(&config.redis_url).expect("Failed to open Redis client");
    let connections = ConnectionRegistry::new();
    let (write_tx, write_rx) = mpsc::unbounded_channel();

    let game_manager = GameManager::new(pool.clone(), write_tx.clone()).start();

    // Background processors: write-behind pump and matchmaking sweep.
    writer::start(queue.clone(), pool, write_rx);
    matchmaking::start(queue.clone(), connections.clone(), write_tx);

    let port = config.port;
    info!("WebSocket server listening on 0.0.0.0:{}", port);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(queue.clone()))
            .app_data(web::Data::new(connections.clone()))
            .app_data(web::Data::new(game_manager.clone()))
            .app_data(web::Data::new(config.clone()))
            .route("/ws", web::get().to(ws_handler))
    })
    .bind(("0.0.0.0", port))?
    .run()
    .await
}
