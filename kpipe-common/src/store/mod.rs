//! Status Store
//!
//! Shared key/value record per file: current status, last error and
//! per-stage retry counters. All operations are atomic per filename;
//! nothing here transacts across files.

mod memory;
mod sqlite;

pub use memory::MemoryStatusStore;
pub use sqlite::SqliteStatusStore;

use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::{Error, FileError, FileRecord, FileStatus, Result};

/// Reject anything but a single forward step
pub(crate) fn check_step(from: FileStatus, to: FileStatus) -> Result<()> {
    if to == FileStatus::Error || !from.can_advance_to(to) {
        return Err(Error::InvalidInput(format!("{} -> {} is not a forward step", from, to)));
    }
    Ok(())
}

/// Outcome of a compare-and-set transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Status moved to the target
    Moved,
    /// File was not at the expected status; nothing written
    Unchanged(FileStatus),
    /// No record; nothing written
    Missing,
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Full record, or `None` if the file never entered the pipeline
    async fn get(&self, filename: &str) -> Result<Option<FileRecord>>;

    /// Unconditional write; creates the record if missing
    async fn set_status(&self, filename: &str, status: FileStatus) -> Result<()>;

    /// Insert a new record at `status`. Returns false, writing nothing, if
    /// the file already has a record.
    async fn create(&self, filename: &str, status: FileStatus) -> Result<bool>;

    /// Compare-and-set: moves to `to` only while the file is at `from`.
    /// `from -> to` must be a single forward step. Never creates a record.
    async fn advance_status(&self, filename: &str, from: FileStatus, to: FileStatus) -> Result<Advance>;

    /// Record a terminal failure; the file moves to `error` in the same write
    async fn set_error(&self, filename: &str, error: &FileError) -> Result<()>;

    /// `set_error` only while the file is still at `expected`. Returns
    /// whether the failure was recorded.
    async fn set_error_if(&self, filename: &str, expected: FileStatus, error: &FileError) -> Result<bool>;

    async fn clear_error(&self, filename: &str) -> Result<()>;

    async fn list_by_status(&self, status: FileStatus) -> Result<Vec<String>>;

    /// Increment and return the failed-attempt count for (stage, file)
    async fn incr_retry_counter(&self, stage: &str, filename: &str) -> Result<u32>;

    async fn reset_retry_counters(&self, filename: &str) -> Result<()>;

    /// Every record, ordered by filename
    async fn list_all(&self) -> Result<Vec<FileRecord>>;

    /// Administrative reset: `queued`, no error, counters cleared.
    /// Returns false if the file is unknown.
    async fn reset_file(&self, filename: &str) -> Result<bool>;

    /// Remove every record and counter; returns the number of files removed
    async fn purge_all(&self) -> Result<u64>;

    /// Number of files per status; every status is present, zero if empty
    async fn count_by_status(&self) -> Result<BTreeMap<String, u64>> {
        let mut counts = BTreeMap::new();
        for status in FileStatus::ALL {
            let files = self.list_by_status(status).await?;
            counts.insert(status.as_str().to_string(), files.len() as u64);
        }
        Ok(counts)
    }
}
