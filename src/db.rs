pub mod models;

use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Opens the connection pool and runs pending migrations.
pub async fn init_db(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    info!("Initializing database: {}", database_url);

    if let Some(parent) = Path::new(database_url.trim_start_matches("sqlite://")).parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(sqlx::Error::Io)?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&format!("{}?mode=rwc", database_url))
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("Database initialized");

    Ok(pool)
}
