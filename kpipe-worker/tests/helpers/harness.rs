//! In-memory pipeline driven one poll at a time

use kpipe_common::config::PipelineConfig;
use kpipe_common::{FileRecord, FileStatus, MemoryBroker, MemoryStatusStore, StageKind, StatusStore, StreamBroker};
use kpipe_worker::chunker::ChunkingConfig;
use kpipe_worker::notify::MemoryNotifier;
use kpipe_worker::stages::{MetadataStage, OrganizeStage, PackageStage, SplitStage};
use kpipe_worker::worker::StageWorker;
use kpipe_worker::Pipeline;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

use super::fake_separator::FakeSeparator;

/// Defaults with no retry delay and non-blocking reads
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    for kind in StageKind::ALL {
        let stage = config.stages.get_mut(kind);
        stage.retry_delay_ms = 0;
        stage.block_timeout_ms = 0;
        stage.max_retries = 3;
    }
    config
}

pub struct Harness {
    pub dir: TempDir,
    pub pipeline: Pipeline,
    pub store: Arc<MemoryStatusStore>,
    pub broker: Arc<MemoryBroker>,
    pub notifier: Arc<MemoryNotifier>,
    pub separator: Arc<FakeSeparator>,
    workers: Vec<StageWorker>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_separator(test_config(), FakeSeparator::new()).await
    }

    pub async fn with_separator(config: PipelineConfig, separator: FakeSeparator) -> Self {
        let dir = TempDir::new().unwrap();
        let paths = config.resolve_paths(dir.path());
        paths.create_all().unwrap();

        let store = Arc::new(MemoryStatusStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let notifier = Arc::new(MemoryNotifier::new());
        let separator = Arc::new(separator);

        let chunking = ChunkingConfig::from(&config.split);
        let package = config.package.clone();
        let pipeline = Pipeline::new(config, paths, store.clone(), broker.clone(), notifier.clone());
        let layout = pipeline.layout().clone();

        let workers = vec![
            pipeline.worker_for(Arc::new(MetadataStage::new(layout.clone()))),
            pipeline.worker_for(Arc::new(SplitStage::new(
                layout.clone(),
                separator.clone(),
                vec!["vocals".to_string(), "accompaniment".to_string()],
                chunking,
            ))),
            pipeline.worker_for(Arc::new(PackageStage::new(layout.clone(), package.clone()))),
            pipeline.worker_for(Arc::new(OrganizeStage::new(layout, package.format))),
        ];
        for worker in &workers {
            let def = worker.definition();
            broker.ensure_group(&def.input_topic, &def.group).await.unwrap();
        }

        Self {
            dir,
            pipeline,
            store,
            broker,
            notifier,
            separator,
            workers,
        }
    }

    pub fn input_path(&self, filename: &str) -> PathBuf {
        self.pipeline.paths().input.join(filename)
    }

    pub fn worker(&self, kind: StageKind) -> &StageWorker {
        self.workers
            .iter()
            .find(|w| w.definition().kind == kind)
            .unwrap()
    }

    /// One poll of one stage; returns messages handled
    pub async fn step(&self, kind: StageKind) -> usize {
        self.worker(kind).poll_once().await.unwrap()
    }

    /// Poll every stage until nothing is left to do
    pub async fn drain(&self) {
        loop {
            let mut handled = 0;
            for worker in &self.workers {
                handled += worker.poll_once().await.unwrap();
            }
            if handled == 0 {
                break;
            }
        }
    }

    pub async fn record(&self, filename: &str) -> FileRecord {
        self.store.get(filename).await.unwrap().unwrap()
    }

    pub async fn status(&self, filename: &str) -> FileStatus {
        self.record(filename).await.status
    }
}
