//! Database initialization
//!
//! Every worker process opens the same SQLite file. Tables are created
//! idempotently so any worker may be the first to start.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Open (or create) the shared pipeline database and ensure all tables exist
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Pragmas go on the connect options so every pooled connection gets them.
    // WAL lets the status server read while stage workers write.
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(5000));

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_tables(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory database (tests, one-shot CLI runs)
///
/// `sqlite::memory:` gives every connection its own database, so the pool
/// is pinned to one connection.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    create_tables(&pool).await?;

    Ok(pool)
}

/// Create every pipeline table (idempotent)
pub async fn create_tables(pool: &SqlitePool) -> Result<()> {
    create_files_table(pool).await?;
    create_retry_counters_table(pool).await?;
    create_stream_messages_table(pool).await?;
    create_stream_groups_table(pool).await?;
    create_stream_pending_table(pool).await?;
    Ok(())
}

/// Per-file status record
pub async fn create_files_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            filename TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_status ON files(status)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Failed attempts per (file, stage)
pub async fn create_retry_counters_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS retry_counters (
            filename TEXT NOT NULL,
            stage TEXT NOT NULL,
            count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (filename, stage)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Append-only log shared by all topics; `id` is the broker message id
pub async fn create_stream_messages_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stream_messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            topic TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_stream_messages_topic ON stream_messages(topic, id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Consumer group cursor: highest message id handed out to the group
pub async fn create_stream_groups_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stream_groups (
            topic TEXT NOT NULL,
            group_name TEXT NOT NULL,
            last_delivered_id INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            PRIMARY KEY (topic, group_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Delivered but not yet acknowledged messages
pub async fn create_stream_pending_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stream_pending (
            topic TEXT NOT NULL,
            group_name TEXT NOT NULL,
            message_id INTEGER NOT NULL,
            consumer TEXT NOT NULL,
            delivery_count INTEGER NOT NULL DEFAULT 1,
            delivered_at TEXT NOT NULL,
            PRIMARY KEY (topic, group_name, message_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_database_creates_file_and_tables() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("pipeline.db");

        let pool = init_database(&db_path).await.unwrap();
        assert!(db_path.exists());

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();

        for expected in ["files", "retry_counters", "stream_groups", "stream_messages", "stream_pending"] {
            assert!(tables.iter().any(|t| t == expected), "missing table {}", expected);
        }
    }

    #[tokio::test]
    async fn test_create_tables_is_idempotent() {
        let pool = init_memory_database().await.unwrap();
        create_tables(&pool).await.unwrap();
        create_tables(&pool).await.unwrap();
    }
}
