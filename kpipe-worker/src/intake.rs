//! Pipeline entry
//!
//! Copies source files into the queue directory, marks them `queued` and
//! asks the metadata stage to start. Continuous directory watching is not
//! done here; `scan` is a one-shot pass over an input folder.

use kpipe_common::topics::STREAM_QUEUED;
use kpipe_common::{Error, FileStatus, Result, StatusStore, StreamBroker, WorkMessage};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::layout::clean_string;

/// Extensions picked up by `scan`
pub const AUDIO_EXTENSIONS: [&str; 6] = ["mp3", "wav", "flac", "ogg", "m4a", "aac"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued(String),
    /// Record is in `error`; only an administrative retry brings it back
    SkippedError(String),
    /// Already tracked at this status; left where it is
    InPipeline(String, FileStatus),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub queued: Vec<String>,
    pub skipped: usize,
    pub failed: usize,
}

pub struct Intake {
    queue_dir: PathBuf,
    store: Arc<dyn StatusStore>,
    broker: Arc<dyn StreamBroker>,
}

impl Intake {
    pub fn new(queue_dir: PathBuf, store: Arc<dyn StatusStore>, broker: Arc<dyn StreamBroker>) -> Self {
        Self {
            queue_dir,
            store,
            broker,
        }
    }

    pub async fn enqueue(&self, path: &Path) -> Result<EnqueueOutcome> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(clean_string)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::InvalidInput(format!("Not a file name: {}", path.display())))?;

        if !tokio::fs::metadata(path).await?.is_file() {
            return Err(Error::InvalidInput(format!("Not a regular file: {}", path.display())));
        }

        if let Some(record) = self.store.get(&filename).await? {
            return Ok(self.already_tracked(filename, record.status));
        }

        tokio::fs::create_dir_all(&self.queue_dir).await?;
        let dest = self.queue_dir.join(&filename);
        if dest != path {
            tokio::fs::copy(path, &dest).await?;
        }

        if !self.store.create(&filename, FileStatus::Queued).await? {
            // Another intake got there first
            let status = self
                .store
                .get(&filename)
                .await?
                .map_or(FileStatus::Queued, |record| record.status);
            return Ok(self.already_tracked(filename, status));
        }
        let id = self
            .broker
            .publish(STREAM_QUEUED, &WorkMessage::new(filename.clone()))
            .await?;

        info!(file = %filename, message_id = %id, "Queued file");
        Ok(EnqueueOutcome::Queued(filename))
    }

    fn already_tracked(&self, filename: String, status: FileStatus) -> EnqueueOutcome {
        if status == FileStatus::Error {
            warn!(file = %filename, "File is in error state, skipping");
            EnqueueOutcome::SkippedError(filename)
        } else {
            info!(file = %filename, status = %status, "File already in pipeline, leaving it");
            EnqueueOutcome::InPipeline(filename, status)
        }
    }

    /// Enqueue every audio file under `input_dir` not already in the queue
    pub async fn scan(&self, input_dir: &Path) -> Result<ScanReport> {
        if !input_dir.is_dir() {
            return Err(Error::NotFound(format!("Input folder {}", input_dir.display())));
        }

        let candidates: Vec<PathBuf> = WalkDir::new(input_dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file() && is_audio(entry.path()))
            .map(|entry| entry.into_path())
            .collect();

        let mut report = ScanReport::default();
        for path in candidates {
            let already_queued = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| self.queue_dir.join(clean_string(n)).exists())
                .unwrap_or(false);
            if already_queued {
                debug!(path = %path.display(), "Already in queue folder");
                report.skipped += 1;
                continue;
            }

            match self.enqueue(&path).await {
                Ok(EnqueueOutcome::Queued(name)) => report.queued.push(name),
                Ok(EnqueueOutcome::SkippedError(_) | EnqueueOutcome::InPipeline(..)) => report.skipped += 1,
                Err(e) => {
                    warn!(path = %path.display(), "Failed to queue file: {}", e);
                    report.failed += 1;
                }
            }
        }

        info!(
            folder = %input_dir.display(),
            queued = report.queued.len(),
            skipped = report.skipped,
            failed = report.failed,
            "Scan complete"
        );
        Ok(report)
    }
}

fn is_audio(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| AUDIO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kpipe_common::{FileError, MemoryBroker, MemoryStatusStore};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        input: PathBuf,
        queue: PathBuf,
        store: Arc<MemoryStatusStore>,
        broker: Arc<MemoryBroker>,
        intake: Intake,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("input");
        let queue = dir.path().join("queue");
        std::fs::create_dir_all(&input).unwrap();
        let store = Arc::new(MemoryStatusStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let intake = Intake::new(queue.clone(), store.clone(), broker.clone());
        Fixture {
            _dir: dir,
            input,
            queue,
            store,
            broker,
            intake,
        }
    }

    #[tokio::test]
    async fn test_enqueue_copies_marks_and_publishes() {
        let f = fixture();
        let src = f.input.join("song.mp3");
        std::fs::write(&src, b"ID3").unwrap();

        let outcome = f.intake.enqueue(&src).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Queued("song.mp3".into()));
        assert!(f.queue.join("song.mp3").is_file());
        assert_eq!(
            f.store.get("song.mp3").await.unwrap().unwrap().status,
            FileStatus::Queued
        );
        assert_eq!(f.broker.messages(STREAM_QUEUED), vec![WorkMessage::new("song.mp3")]);
    }

    #[tokio::test]
    async fn test_enqueue_skips_files_in_error() {
        let f = fixture();
        let src = f.input.join("bad.mp3");
        std::fs::write(&src, b"x").unwrap();
        f.store
            .set_error("bad.mp3", &FileError::new("metadata", "not audio", ""))
            .await
            .unwrap();

        let outcome = f.intake.enqueue(&src).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::SkippedError("bad.mp3".into()));
        assert!(f.broker.messages(STREAM_QUEUED).is_empty());
        assert_eq!(
            f.store.get("bad.mp3").await.unwrap().unwrap().status,
            FileStatus::Error
        );
    }

    #[tokio::test]
    async fn test_enqueue_leaves_tracked_files_alone() {
        let f = fixture();
        let src = f.input.join("song.mp3");
        std::fs::write(&src, b"ID3").unwrap();
        f.intake.enqueue(&src).await.unwrap();
        f.store.set_status("song.mp3", FileStatus::Organized).await.unwrap();

        let outcome = f.intake.enqueue(&src).await.unwrap();
        assert_eq!(
            outcome,
            EnqueueOutcome::InPipeline("song.mp3".into(), FileStatus::Organized)
        );
        assert_eq!(
            f.store.get("song.mp3").await.unwrap().unwrap().status,
            FileStatus::Organized
        );
        assert_eq!(f.broker.messages(STREAM_QUEUED).len(), 1);

        // Scan from another folder counts it as skipped
        let other = f.input.join("again");
        std::fs::create_dir_all(&other).unwrap();
        std::fs::write(other.join("song.mp3"), b"ID3").unwrap();
        std::fs::remove_file(f.queue.join("song.mp3")).unwrap();
        let report = f.intake.scan(&other).await.unwrap();
        assert!(report.queued.is_empty());
        assert_eq!(report.skipped, 1);
        assert_eq!(
            f.store.get("song.mp3").await.unwrap().unwrap().status,
            FileStatus::Organized
        );
    }

    #[tokio::test]
    async fn test_enqueue_rejects_directories() {
        let f = fixture();
        assert!(matches!(
            f.intake.enqueue(&f.input).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_scan_picks_new_audio_only() {
        let f = fixture();
        std::fs::write(f.input.join("a.mp3"), b"1").unwrap();
        std::fs::create_dir_all(f.input.join("album")).unwrap();
        std::fs::write(f.input.join("album").join("b.FLAC"), b"2").unwrap();
        std::fs::write(f.input.join("cover.jpg"), b"3").unwrap();
        std::fs::create_dir_all(&f.queue).unwrap();
        std::fs::write(f.queue.join("c.wav"), b"4").unwrap();
        std::fs::write(f.input.join("c.wav"), b"4").unwrap();

        let report = f.intake.scan(&f.input).await.unwrap();
        assert_eq!(report.queued, vec!["a.mp3", "b.FLAC"]);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(f.broker.messages(STREAM_QUEUED).len(), 2);
    }

    #[tokio::test]
    async fn test_scan_missing_folder() {
        let f = fixture();
        assert!(matches!(
            f.intake.scan(&f.input.join("nope")).await,
            Err(Error::NotFound(_))
        ));
    }
}
