//! Crash recovery against the SQLite store and broker
//!
//! A message that was delivered but never acknowledged (the process died
//! mid-attempt) is replayed when the stage worker starts again.

mod helpers;

use helpers::{generate_test_wav, test_config, AudioConfig};
use kpipe_common::topics::{STREAM_METADATA_EXTRACTED, STREAM_QUEUED};
use kpipe_common::{FileStatus, StageKind};
use kpipe_worker::stages::MetadataStage;
use kpipe_worker::Pipeline;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn unacknowledged_message_is_replayed_after_restart() {
    let dir = TempDir::new().unwrap();
    let config = test_config();
    let paths = config.resolve_paths(dir.path());

    {
        let pipeline = Pipeline::open(config.clone(), paths.clone()).await.unwrap();
        let src = generate_test_wav(&paths.input.join("song.wav"), &AudioConfig::default()).unwrap();
        pipeline.intake().enqueue(&src).await.unwrap();

        // Delivered to the metadata consumer, then the process "dies"
        let broker = pipeline.broker();
        broker.ensure_group(STREAM_QUEUED, "metadata-group").await.unwrap();
        let batch = broker
            .read_batch(STREAM_QUEUED, "metadata-group", "metadata-consumer", 1, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
    }

    let pipeline = Pipeline::open(config, paths).await.unwrap();
    assert_eq!(
        pipeline.broker().pending_count(STREAM_QUEUED, "metadata-group").await.unwrap(),
        1
    );
    // Nothing new to read; only the pending list holds the message
    let fresh = pipeline
        .broker()
        .read_batch(STREAM_QUEUED, "metadata-group", "other-consumer", 1, Duration::ZERO)
        .await
        .unwrap();
    assert!(fresh.is_empty());

    let worker = pipeline.worker_for(Arc::new(MetadataStage::new(pipeline.layout().clone())));
    assert_eq!(worker.recover_pending().await.unwrap(), 1);

    let record = pipeline.store().get("song.wav").await.unwrap().unwrap();
    assert_eq!(record.status, FileStatus::MetadataExtracted);
    assert_eq!(
        pipeline.broker().pending_count(STREAM_QUEUED, "metadata-group").await.unwrap(),
        0
    );
    assert_eq!(pipeline.broker().topic_len(STREAM_METADATA_EXTRACTED).await.unwrap(), 1);
}

#[tokio::test]
async fn run_loop_processes_and_stops_on_shutdown() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config();
    config.stages.get_mut(StageKind::Metadata).block_timeout_ms = 50;
    let paths = config.resolve_paths(dir.path());
    let pipeline = Pipeline::open(config, paths.clone()).await.unwrap();

    let src = generate_test_wav(&paths.input.join("song.wav"), &AudioConfig::default()).unwrap();
    pipeline.intake().enqueue(&src).await.unwrap();

    let worker = pipeline.worker(StageKind::Metadata).unwrap();
    let shutdown = CancellationToken::new();
    let stopper = shutdown.clone();

    let store = pipeline.store().clone();
    let watcher = async move {
        for _ in 0..100 {
            let status = store.get("song.wav").await.unwrap().map(|r| r.status);
            if status == Some(FileStatus::MetadataExtracted) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        stopper.cancel();
    };

    let (result, _) = tokio::join!(worker.run(shutdown), watcher);
    result.unwrap();

    let record = pipeline.store().get("song.wav").await.unwrap().unwrap();
    assert_eq!(record.status, FileStatus::MetadataExtracted);
}
