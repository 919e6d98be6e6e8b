//! SQLite-backed Status Store shared by all worker processes

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

use super::{Advance, StatusStore};
use crate::db::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};
use crate::{Error, FileError, FileRecord, FileStatus, Result};

#[derive(Clone)]
pub struct SqliteStatusStore {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

impl SqliteStatusStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_lock_wait_ms: DEFAULT_MAX_LOCK_WAIT_MS,
        }
    }

    pub fn with_max_lock_wait(mut self, max_lock_wait_ms: u64) -> Self {
        self.max_lock_wait_ms = max_lock_wait_ms;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_counters(&self, filename: &str) -> Result<BTreeMap<String, u32>> {
        let rows = sqlx::query("SELECT stage, count FROM retry_counters WHERE filename = ?")
            .bind(filename)
            .fetch_all(&self.pool)
            .await?;

        let mut counters = BTreeMap::new();
        for row in rows {
            let stage: String = row.get("stage");
            let count: i64 = row.get("count");
            counters.insert(stage, count.max(0) as u32);
        }
        Ok(counters)
    }

    async fn row_to_record(&self, row: &sqlx::sqlite::SqliteRow) -> Result<FileRecord> {
        let filename: String = row.get("filename");

        let status: String = row.get("status");
        let status: FileStatus = status.parse()?;

        let last_error: Option<String> = row.get("last_error");
        let last_error = last_error
            .map(|json| serde_json::from_str::<FileError>(&json))
            .transpose()?;

        let updated_at: String = row.get("updated_at");
        let updated_at = parse_timestamp(&updated_at)?;

        let retry_counters = self.load_counters(&filename).await?;

        Ok(FileRecord {
            filename,
            status,
            last_error,
            retry_counters,
            updated_at,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("Failed to parse timestamp '{}': {}", value, e)))
}

#[async_trait]
impl StatusStore for SqliteStatusStore {
    async fn get(&self, filename: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query(
            "SELECT filename, status, last_error, updated_at FROM files WHERE filename = ?",
        )
        .bind(filename)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.row_to_record(&row).await?)),
            None => Ok(None),
        }
    }

    async fn set_status(&self, filename: &str, status: FileStatus) -> Result<()> {
        let pool = &self.pool;
        let status = status.as_str();

        retry_on_lock("set_status", self.max_lock_wait_ms, move || async move {
            let now = Utc::now().to_rfc3339();
            sqlx::query(
                r#"
                INSERT INTO files (filename, status, last_error, created_at, updated_at)
                VALUES (?, ?, NULL, ?, ?)
                ON CONFLICT(filename) DO UPDATE SET
                    status = excluded.status,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(filename)
            .bind(status)
            .bind(&now)
            .bind(&now)
            .execute(pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn create(&self, filename: &str, status: FileStatus) -> Result<bool> {
        let pool = &self.pool;
        let status = status.as_str();

        retry_on_lock("create", self.max_lock_wait_ms, move || async move {
            let now = Utc::now().to_rfc3339();
            let inserted = sqlx::query(
                r#"
                INSERT OR IGNORE INTO files (filename, status, last_error, created_at, updated_at)
                VALUES (?, ?, NULL, ?, ?)
                "#,
            )
            .bind(filename)
            .bind(status)
            .bind(&now)
            .bind(&now)
            .execute(pool)
            .await?
            .rows_affected();
            Ok(inserted > 0)
        })
        .await
    }

    async fn advance_status(&self, filename: &str, from: FileStatus, to: FileStatus) -> Result<Advance> {
        super::check_step(from, to)?;
        let pool = &self.pool;

        let moved = retry_on_lock("advance_status", self.max_lock_wait_ms, move || async move {
            let updated = sqlx::query(
                "UPDATE files SET status = ?, updated_at = ? WHERE filename = ? AND status = ?",
            )
            .bind(to.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(filename)
            .bind(from.as_str())
            .execute(pool)
            .await?
            .rows_affected();
            Ok(updated > 0)
        })
        .await?;

        if moved {
            return Ok(Advance::Moved);
        }

        let current: Option<String> = sqlx::query_scalar("SELECT status FROM files WHERE filename = ?")
            .bind(filename)
            .fetch_optional(&self.pool)
            .await?;
        match current {
            Some(status) => Ok(Advance::Unchanged(status.parse()?)),
            None => Ok(Advance::Missing),
        }
    }

    async fn set_error(&self, filename: &str, error: &FileError) -> Result<()> {
        let pool = &self.pool;
        let error_json = serde_json::to_string(error)?;
        let error_json = error_json.as_str();

        retry_on_lock("set_error", self.max_lock_wait_ms, move || async move {
            let now = Utc::now().to_rfc3339();
            sqlx::query(
                r#"
                INSERT INTO files (filename, status, last_error, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(filename) DO UPDATE SET
                    status = excluded.status,
                    last_error = excluded.last_error,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(filename)
            .bind(FileStatus::Error.as_str())
            .bind(error_json)
            .bind(&now)
            .bind(&now)
            .execute(pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn set_error_if(&self, filename: &str, expected: FileStatus, error: &FileError) -> Result<bool> {
        let pool = &self.pool;
        let error_json = serde_json::to_string(error)?;
        let error_json = error_json.as_str();

        retry_on_lock("set_error_if", self.max_lock_wait_ms, move || async move {
            let updated = sqlx::query(
                r#"
                UPDATE files SET status = ?, last_error = ?, updated_at = ?
                WHERE filename = ? AND status = ?
                "#,
            )
            .bind(FileStatus::Error.as_str())
            .bind(error_json)
            .bind(Utc::now().to_rfc3339())
            .bind(filename)
            .bind(expected.as_str())
            .execute(pool)
            .await?
            .rows_affected();
            Ok(updated > 0)
        })
        .await
    }

    async fn clear_error(&self, filename: &str) -> Result<()> {
        let pool = &self.pool;

        retry_on_lock("clear_error", self.max_lock_wait_ms, move || async move {
            sqlx::query("UPDATE files SET last_error = NULL, updated_at = ? WHERE filename = ?")
                .bind(Utc::now().to_rfc3339())
                .bind(filename)
                .execute(pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn list_by_status(&self, status: FileStatus) -> Result<Vec<String>> {
        let files: Vec<String> =
            sqlx::query_scalar("SELECT filename FROM files WHERE status = ? ORDER BY filename")
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?;
        Ok(files)
    }

    async fn incr_retry_counter(&self, stage: &str, filename: &str) -> Result<u32> {
        let pool = &self.pool;

        let count: i64 = retry_on_lock("incr_retry_counter", self.max_lock_wait_ms, move || async move {
            let count: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO retry_counters (filename, stage, count) VALUES (?, ?, 1)
                ON CONFLICT(filename, stage) DO UPDATE SET count = count + 1
                RETURNING count
                "#,
            )
            .bind(filename)
            .bind(stage)
            .fetch_one(pool)
            .await?;
            Ok(count)
        })
        .await?;

        Ok(count.max(0) as u32)
    }

    async fn reset_retry_counters(&self, filename: &str) -> Result<()> {
        let pool = &self.pool;

        retry_on_lock("reset_retry_counters", self.max_lock_wait_ms, move || async move {
            sqlx::query("DELETE FROM retry_counters WHERE filename = ?")
                .bind(filename)
                .execute(pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn list_all(&self) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query(
            "SELECT filename, status, last_error, updated_at FROM files ORDER BY filename",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(self.row_to_record(row).await?);
        }
        Ok(records)
    }

    async fn reset_file(&self, filename: &str) -> Result<bool> {
        let pool = &self.pool;

        retry_on_lock("reset_file", self.max_lock_wait_ms, move || async move {
            let mut tx = pool.begin().await?;

            let updated = sqlx::query(
                "UPDATE files SET status = ?, last_error = NULL, updated_at = ? WHERE filename = ?",
            )
            .bind(FileStatus::Queued.as_str())
            .bind(Utc::now().to_rfc3339())
            .bind(filename)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if updated == 0 {
                tx.rollback().await?;
                return Ok(false);
            }

            sqlx::query("DELETE FROM retry_counters WHERE filename = ?")
                .bind(filename)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;
            Ok(true)
        })
        .await
    }

    async fn purge_all(&self) -> Result<u64> {
        let pool = &self.pool;

        retry_on_lock("purge_all", self.max_lock_wait_ms, move || async move {
            let mut tx = pool.begin().await?;
            let removed = sqlx::query("DELETE FROM files")
                .execute(&mut *tx)
                .await?
                .rows_affected();
            sqlx::query("DELETE FROM retry_counters")
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(removed)
        })
        .await
    }

    async fn count_by_status(&self) -> Result<BTreeMap<String, u64>> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM files GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts: BTreeMap<String, u64> = FileStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            counts.insert(status, n.max(0) as u64);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_database, init_memory_database};

    #[tokio::test]
    async fn test_sqlite_store_contract() {
        let pool = init_memory_database().await.unwrap();
        let store = SqliteStatusStore::new(pool);
        crate::store::contract::exercise(&store).await;
    }

    #[tokio::test]
    async fn test_lock_wait_defaults_from_db_module() {
        let store = SqliteStatusStore::new(init_memory_database().await.unwrap());
        assert_eq!(store.max_lock_wait_ms, crate::db::DEFAULT_MAX_LOCK_WAIT_MS);
        assert_eq!(store.with_max_lock_wait(10).max_lock_wait_ms, 10);
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let db_path = temp_dir.path().join("pipeline.db");

        {
            let store = SqliteStatusStore::new(init_database(&db_path).await.unwrap());
            store.set_status("song.mp3", FileStatus::Split).await.unwrap();
            store.incr_retry_counter("packager", "song.mp3").await.unwrap();
            store.pool().close().await;
        }

        let store = SqliteStatusStore::new(init_database(&db_path).await.unwrap());
        let record = store.get("song.mp3").await.unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Split);
        assert_eq!(record.retries_for("packager"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_writers_on_different_files() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let store = SqliteStatusStore::new(
            init_database(&temp_dir.path().join("pipeline.db")).await.unwrap(),
        );

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let name = format!("song-{}.mp3", i);
                store.create(&name, FileStatus::Queued).await.unwrap();
                let mut current = FileStatus::Queued;
                for status in [FileStatus::MetadataExtracted, FileStatus::Split, FileStatus::Packaged] {
                    assert_eq!(store.advance_status(&name, current, status).await.unwrap(), Advance::Moved);
                    current = status;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.list_by_status(FileStatus::Packaged).await.unwrap().len(), 8);
    }
}
