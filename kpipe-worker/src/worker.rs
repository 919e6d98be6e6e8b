//! Stage Worker
//!
//! One parametrized consume loop shared by every stage. For each message:
//! look up the file, run the stage operation, advance the status and publish
//! to the next topic, all as one unit under the Retry Policy. The input
//! message is acknowledged afterwards whatever the outcome; terminal failures
//! live on in the Status Store and come back through an administrative retry.

use async_trait::async_trait;
use kpipe_common::config::PipelineConfig;
use kpipe_common::store::Advance;
use kpipe_common::{FileStatus, StageKind, StatusStore, StreamBroker, StreamMessage, WorkMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::StageResult;
use crate::notify::Notifier;
use crate::retry::{Attempt, RetryOutcome, RetryPolicy, RetrySettings};

/// Upper bound on pending messages replayed at start-up
const MAX_RECOVERED: usize = 1000;

/// Stage-specific work on one file.
///
/// Must be re-entrant: when its output already exists it reports success
/// without redoing the work.
#[async_trait]
pub trait StageOperation: Send + Sync {
    fn kind(&self) -> StageKind;

    async fn operate(&self, filename: &str) -> StageResult<()>;
}

/// Wiring of one stage into the pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct StageDefinition {
    pub kind: StageKind,
    pub input_topic: String,
    pub output_topic: String,
    pub group: String,
    pub consumer: String,
    pub retry: RetrySettings,
    pub batch_size: usize,
    pub block_timeout: Duration,
}

impl StageDefinition {
    pub fn from_config(kind: StageKind, config: &PipelineConfig) -> Self {
        let settings = config.stages.get(kind);
        Self {
            kind,
            input_topic: kind.input_topic().to_string(),
            output_topic: kind.output_topic().to_string(),
            group: config.group_for(kind),
            consumer: config.consumer_for(kind),
            retry: RetrySettings::from(settings),
            batch_size: settings.batch_size.max(1),
            block_timeout: settings.block_timeout(),
        }
    }
}

/// What happened to one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    /// Status advanced and the next stage notified
    Advanced,
    /// Already at or past this stage; nothing republished
    AlreadyDone,
    /// File is in `error`, unknown, or was reset behind this message
    Skipped,
    /// Retry budget exhausted; file is now in `error`
    Failed,
}

pub struct StageWorker {
    definition: StageDefinition,
    operation: Arc<dyn StageOperation>,
    store: Arc<dyn StatusStore>,
    broker: Arc<dyn StreamBroker>,
    retry: RetryPolicy,
}

impl StageWorker {
    pub fn new(
        definition: StageDefinition,
        operation: Arc<dyn StageOperation>,
        store: Arc<dyn StatusStore>,
        broker: Arc<dyn StreamBroker>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let retry = RetryPolicy::new(store.clone(), notifier);
        Self {
            definition,
            operation,
            store,
            broker,
            retry,
        }
    }

    pub fn definition(&self) -> &StageDefinition {
        &self.definition
    }

    fn stage(&self) -> &'static str {
        self.definition.kind.as_str()
    }

    /// Consume until `shutdown` fires. Shutdown is only observed between
    /// batches, so a started unit of work always runs to completion.
    pub async fn run(&self, shutdown: CancellationToken) -> kpipe_common::Result<()> {
        let def = &self.definition;
        self.broker.ensure_group(&def.input_topic, &def.group).await?;
        info!(
            stage = self.stage(),
            topic = %def.input_topic,
            group = %def.group,
            consumer = %def.consumer,
            "Stage worker listening"
        );

        match self.recover_pending().await {
            Ok(0) => {}
            Ok(n) => info!(stage = self.stage(), recovered = n, "Replayed unacknowledged messages"),
            Err(e) => warn!(stage = self.stage(), "Pending message recovery failed: {}", e),
        }

        while !shutdown.is_cancelled() {
            if let Err(e) = self.poll_once().await {
                // Broker trouble never ends the loop
                warn!(stage = self.stage(), "Stream read failed: {}", e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(def.block_timeout.max(Duration::from_millis(100))) => {}
                }
            }
        }

        info!(stage = self.stage(), "Stage worker stopped");
        Ok(())
    }

    /// Process messages this consumer received but never acknowledged
    pub async fn recover_pending(&self) -> kpipe_common::Result<usize> {
        let def = &self.definition;
        let pending = self
            .broker
            .read_pending(&def.input_topic, &def.group, &def.consumer, MAX_RECOVERED)
            .await?;

        for message in &pending {
            info!(
                stage = self.stage(),
                file = %message.message.file,
                deliveries = message.delivery_count,
                "Recovering pending message"
            );
            self.handle_message(message).await;
        }
        Ok(pending.len())
    }

    /// Read and handle one batch. Returns the number of messages handled.
    pub async fn poll_once(&self) -> kpipe_common::Result<usize> {
        let def = &self.definition;
        let batch = self
            .broker
            .read_batch(
                &def.input_topic,
                &def.group,
                &def.consumer,
                def.batch_size,
                def.block_timeout,
            )
            .await?;

        for message in &batch {
            self.handle_message(message).await;
        }
        Ok(batch.len())
    }

    /// Process one message and acknowledge it unconditionally
    pub async fn handle_message(&self, message: &StreamMessage) -> FileOutcome {
        let outcome = self.process_file(&message.message.file).await;

        let def = &self.definition;
        if let Err(e) = self.broker.ack(&def.input_topic, &def.group, message.id).await {
            // Left pending; replayed on the next start-up
            warn!(stage = self.stage(), id = %message.id, "Acknowledge failed: {}", e);
        }
        outcome
    }

    /// Run this stage for `filename` under the Retry Policy
    pub async fn process_file(&self, filename: &str) -> FileOutcome {
        let kind = self.definition.kind;

        match self.store.get(filename).await {
            Ok(Some(record)) => {
                if record.status == FileStatus::Error {
                    info!(stage = self.stage(), file = filename, "File is in error, skipping");
                    return FileOutcome::Skipped;
                }
                if is_at_or_past(record.status, kind.target_status()) {
                    debug!(stage = self.stage(), file = filename, status = %record.status, "Already done");
                    return FileOutcome::AlreadyDone;
                }
                if is_before(record.status, kind.input_status()) {
                    // Reset behind this message; the fresh chain will bring it here
                    info!(stage = self.stage(), file = filename, status = %record.status, "Stale message, skipping");
                    return FileOutcome::Skipped;
                }
            }
            Ok(None) => {
                // Records are only created by intake
                info!(stage = self.stage(), file = filename, "Unknown file, skipping");
                return FileOutcome::Skipped;
            }
            Err(e) => {
                // Store outage is just a failed attempt inside the unit below
                warn!(stage = self.stage(), file = filename, "Status lookup failed: {}", e);
            }
        }

        let unit = StageUnit {
            worker: self,
            advanced: AtomicBool::new(false),
        };
        match self
            .retry
            .handle_auto_retry(kind.retry_name(), filename, self.definition.retry, &unit)
            .await
        {
            RetryOutcome::Succeeded { value, attempts } => {
                if value == FileOutcome::Advanced {
                    info!(stage = self.stage(), file = filename, attempts, status = %kind.target_status(), "Stage complete");
                }
                value
            }
            RetryOutcome::Failed { .. } => FileOutcome::Failed,
            RetryOutcome::Abandoned { .. } => FileOutcome::Skipped,
        }
    }
}

/// Operation, status advance and downstream publish: the retried unit
struct StageUnit<'a> {
    worker: &'a StageWorker,
    /// Set once this retry sequence has moved the status, so a retry after a
    /// failed publish still publishes
    advanced: AtomicBool,
}

#[async_trait]
impl<'a> Attempt for StageUnit<'a> {
    type Output = FileOutcome;

    async fn attempt(&self, filename: &str) -> StageResult<FileOutcome> {
        let worker = self.worker;
        let kind = worker.definition.kind;
        let (from, to) = (kind.input_status(), kind.target_status());

        worker.operation.operate(filename).await?;

        match worker.store.advance_status(filename, from, to).await? {
            Advance::Moved => self.advanced.store(true, Ordering::SeqCst),
            Advance::Unchanged(current) if current == to && self.advanced.load(Ordering::SeqCst) => {}
            Advance::Unchanged(FileStatus::Error) => return Ok(FileOutcome::Skipped),
            Advance::Unchanged(current) if is_at_or_past(current, to) => return Ok(FileOutcome::AlreadyDone),
            Advance::Unchanged(current) => {
                // Reset behind this attempt; the fresh chain will bring it here
                info!(stage = worker.stage(), file = filename, status = %current, "File moved during attempt, not advancing");
                return Ok(FileOutcome::Skipped);
            }
            Advance::Missing => {
                info!(stage = worker.stage(), file = filename, "Record removed during attempt, not advancing");
                return Ok(FileOutcome::Skipped);
            }
        }

        worker
            .broker
            .publish(&worker.definition.output_topic, &WorkMessage::new(filename))
            .await?;
        Ok(FileOutcome::Advanced)
    }

    fn expected_status(&self) -> Option<FileStatus> {
        let kind = self.worker.definition.kind;
        if self.advanced.load(Ordering::SeqCst) {
            Some(kind.target_status())
        } else {
            Some(kind.input_status())
        }
    }
}

fn is_at_or_past(current: FileStatus, target: FileStatus) -> bool {
    matches!((current.rank(), target.rank()), (Some(c), Some(t)) if c >= t)
}

fn is_before(current: FileStatus, input: FileStatus) -> bool {
    matches!((current.rank(), input.rank()), (Some(c), Some(i)) if c < i)
}

/// Run each worker on its own task until `shutdown` fires. The first
/// worker to fail cancels the others.
pub async fn run_all(workers: Vec<StageWorker>, shutdown: CancellationToken) -> kpipe_common::Result<()> {
    let mut tasks = JoinSet::new();
    for worker in workers {
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let result = worker.run(shutdown.clone()).await;
            if let Err(e) = &result {
                error!(stage = %worker.definition().kind, "Stage worker failed: {}", e);
                shutdown.cancel();
            }
            result
        });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined
            .map_err(|e| kpipe_common::Error::Internal(format!("Stage worker task ended abnormally: {}", e)))
            .and_then(|r| r);
        if let Err(e) = result {
            shutdown.cancel();
            first_error.get_or_insert(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}
