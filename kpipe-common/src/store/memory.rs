//! In-process Status Store
//!
//! Used by single-process deployments without a database file and by tests.
//! `fail_next_writes` simulates an unavailable store.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{Advance, StatusStore};
use crate::{Error, FileError, FileRecord, FileStatus, Result};

#[derive(Clone, Default)]
pub struct MemoryStatusStore {
    /// Records without their counters
    records: Arc<RwLock<HashMap<String, FileRecord>>>,
    /// Counters live apart from records, so bumping one never creates a file
    counters: Arc<RwLock<HashMap<String, BTreeMap<String, u32>>>>,
    failing_writes: Arc<AtomicU32>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` write operations fail with a store error
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        let remaining = self.failing_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Internal("status store unavailable".to_string()));
        }
        Ok(())
    }

    async fn with_counters(&self, mut record: FileRecord) -> FileRecord {
        record.retry_counters = self
            .counters
            .read()
            .await
            .get(&record.filename)
            .cloned()
            .unwrap_or_default();
        record
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn get(&self, filename: &str) -> Result<Option<FileRecord>> {
        let record = self.records.read().await.get(filename).cloned();
        match record {
            Some(record) => Ok(Some(self.with_counters(record).await)),
            None => Ok(None),
        }
    }

    async fn set_status(&self, filename: &str, status: FileStatus) -> Result<()> {
        self.check_available()?;
        let mut records = self.records.write().await;
        let record = records
            .entry(filename.to_string())
            .or_insert_with(|| FileRecord::new(filename, status));
        record.status = status;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn create(&self, filename: &str, status: FileStatus) -> Result<bool> {
        self.check_available()?;
        let mut records = self.records.write().await;
        if records.contains_key(filename) {
            return Ok(false);
        }
        records.insert(filename.to_string(), FileRecord::new(filename, status));
        Ok(true)
    }

    async fn advance_status(&self, filename: &str, from: FileStatus, to: FileStatus) -> Result<Advance> {
        super::check_step(from, to)?;
        self.check_available()?;
        match self.records.write().await.get_mut(filename) {
            Some(record) if record.status == from => {
                record.status = to;
                record.updated_at = Utc::now();
                Ok(Advance::Moved)
            }
            Some(record) => Ok(Advance::Unchanged(record.status)),
            None => Ok(Advance::Missing),
        }
    }

    async fn set_error(&self, filename: &str, error: &FileError) -> Result<()> {
        self.check_available()?;
        let mut records = self.records.write().await;
        let record = records
            .entry(filename.to_string())
            .or_insert_with(|| FileRecord::new(filename, FileStatus::Error));
        record.status = FileStatus::Error;
        record.last_error = Some(error.clone());
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn set_error_if(&self, filename: &str, expected: FileStatus, error: &FileError) -> Result<bool> {
        self.check_available()?;
        match self.records.write().await.get_mut(filename) {
            Some(record) if record.status == expected => {
                record.status = FileStatus::Error;
                record.last_error = Some(error.clone());
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear_error(&self, filename: &str) -> Result<()> {
        self.check_available()?;
        if let Some(record) = self.records.write().await.get_mut(filename) {
            record.last_error = None;
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_by_status(&self, status: FileStatus) -> Result<Vec<String>> {
        let mut files: Vec<String> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.status == status)
            .map(|r| r.filename.clone())
            .collect();
        files.sort();
        Ok(files)
    }

    async fn incr_retry_counter(&self, stage: &str, filename: &str) -> Result<u32> {
        self.check_available()?;
        let mut counters = self.counters.write().await;
        let count = counters
            .entry(filename.to_string())
            .or_default()
            .entry(stage.to_string())
            .or_insert(0);
        *count += 1;
        Ok(*count)
    }

    async fn reset_retry_counters(&self, filename: &str) -> Result<()> {
        self.check_available()?;
        self.counters.write().await.remove(filename);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<FileRecord>> {
        let snapshot: Vec<FileRecord> = self.records.read().await.values().cloned().collect();
        let mut records = Vec::with_capacity(snapshot.len());
        for record in snapshot {
            records.push(self.with_counters(record).await);
        }
        records.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(records)
    }

    async fn reset_file(&self, filename: &str) -> Result<bool> {
        self.check_available()?;
        let mut records = self.records.write().await;
        match records.get_mut(filename) {
            Some(record) => {
                record.status = FileStatus::Queued;
                record.last_error = None;
                record.updated_at = Utc::now();
                self.counters.write().await.remove(filename);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn purge_all(&self) -> Result<u64> {
        self.check_available()?;
        let mut records = self.records.write().await;
        let removed = records.len() as u64;
        records.clear();
        self.counters.write().await.clear();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_contract() {
        let store = MemoryStatusStore::new();
        crate::store::contract::exercise(&store).await;
    }

    #[tokio::test]
    async fn test_injected_failures_hit_writes_only() {
        let store = MemoryStatusStore::new();
        store.set_status("a.mp3", FileStatus::Queued).await.unwrap();

        store.fail_next_writes(2);
        assert!(store.set_status("a.mp3", FileStatus::Split).await.is_err());
        assert!(store.get("a.mp3").await.unwrap().is_some());
        assert!(store.incr_retry_counter("splitter", "a.mp3").await.is_err());
        store.set_status("a.mp3", FileStatus::Split).await.unwrap();

        assert_eq!(store.get("a.mp3").await.unwrap().unwrap().status, FileStatus::Split);
    }
}
