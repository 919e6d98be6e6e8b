//! Retry Policy
//!
//! The single retry mechanism of the pipeline: a unit of work is attempted
//! up to `max_retries` times with a fixed delay in between. Every failed
//! attempt bumps the durable (stage, file) counter. When the budget runs out
//! (or the failure is permanent) the file is marked `error`, one
//! notification is sent, and the caller gets `RetryOutcome::Failed`.
//! If the file moved on while the attempts ran (an administrative reset),
//! nothing is recorded and the caller gets `RetryOutcome::Abandoned`.
//! Nothing escapes as a panic or an unhandled error.

use async_trait::async_trait;
use kpipe_common::{FileError, FileStatus, StatusStore};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{StageError, StageResult};
use crate::notify::Notifier;

/// Title of the terminal failure notification
pub const FAILURE_TITLE: &str = "Pipeline Error";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl From<&kpipe_common::config::StageSettings> for RetrySettings {
    fn from(settings: &kpipe_common::config::StageSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            retry_delay: settings.retry_delay(),
        }
    }
}

/// One attempt at processing a file
#[async_trait]
pub trait Attempt: Send + Sync {
    type Output: Send;

    async fn attempt(&self, filename: &str) -> StageResult<Self::Output>;

    /// Status the file must still hold for a terminal failure to be
    /// recorded; `None` records unconditionally
    fn expected_status(&self) -> Option<FileStatus> {
        None
    }
}

#[async_trait]
impl<F, Fut, T> Attempt for F
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = StageResult<T>> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    async fn attempt(&self, filename: &str) -> StageResult<T> {
        self(filename.to_string()).await
    }
}

#[derive(Debug)]
pub enum RetryOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    /// The file has been marked `error` and the operator notified
    Failed { attempts: u32, error: StageError },
    /// Attempts ran out but the file no longer held the expected status;
    /// nothing recorded, nobody notified
    Abandoned { attempts: u32, error: StageError },
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Succeeded { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. }
            | RetryOutcome::Failed { attempts, .. }
            | RetryOutcome::Abandoned { attempts, .. } => *attempts,
        }
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    store: Arc<dyn StatusStore>,
    notifier: Arc<dyn Notifier>,
}

impl RetryPolicy {
    pub fn new(store: Arc<dyn StatusStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Run `work` for `filename` under the retry budget of `stage`
    pub async fn handle_auto_retry<W>(
        &self,
        stage: &str,
        filename: &str,
        settings: RetrySettings,
        work: &W,
    ) -> RetryOutcome<W::Output>
    where
        W: Attempt + ?Sized,
    {
        let max_retries = settings.max_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match work.attempt(filename).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(stage, file = filename, attempt, "Succeeded after retry");
                    }
                    return RetryOutcome::Succeeded { value, attempts: attempt };
                }
                Err(err) => err,
            };

            // Counter failures must not stop the retry sequence
            if let Err(store_err) = self.store.incr_retry_counter(stage, filename).await {
                warn!(stage, file = filename, "Could not record failed attempt: {}", store_err);
            }

            if err.is_permanent() || attempt >= max_retries {
                return if self.fail(stage, filename, attempt, work.expected_status(), &err).await {
                    RetryOutcome::Failed { attempts: attempt, error: err }
                } else {
                    RetryOutcome::Abandoned { attempts: attempt, error: err }
                };
            }

            warn!(
                stage,
                file = filename,
                attempt,
                max_retries,
                delay_ms = settings.retry_delay.as_millis() as u64,
                "Attempt failed, retrying: {}",
                err
            );
            tokio::time::sleep(settings.retry_delay).await;
        }
    }

    /// Record and announce a terminal failure. Returns false when the file
    /// is no longer at `expected`.
    async fn fail(
        &self,
        stage: &str,
        filename: &str,
        attempts: u32,
        expected: Option<FileStatus>,
        err: &StageError,
    ) -> bool {
        let record = FileError::from_error(stage, err);
        let recorded = match expected {
            Some(expected) => self.store.set_error_if(filename, expected, &record).await,
            None => self.store.set_error(filename, &record).await.map(|_| true),
        };

        match recorded {
            Ok(false) => {
                info!(stage, file = filename, attempts, "File moved on during attempts, failure dropped: {}", err);
                return false;
            }
            Ok(true) => error!(stage, file = filename, attempts, "Giving up: {}", err),
            Err(store_err) => {
                error!(stage, file = filename, attempts, "Giving up: {}", err);
                error!(stage, file = filename, "Could not record failure: {}", store_err);
            }
        }

        let message = format!(
            "{} failed in stage {} after {} attempt{}: {}",
            filename,
            stage,
            attempts,
            if attempts == 1 { "" } else { "s" },
            err
        );
        self.notifier.notify(FAILURE_TITLE, &message).await;
        true
    }
}
