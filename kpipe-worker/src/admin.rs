//! Administrative control over file records

use kpipe_common::topics::STREAM_QUEUED;
use kpipe_common::{Error, Result, StatusStore, StreamBroker, WorkMessage};
use std::sync::Arc;
use tracing::{info, warn};

use crate::notify::Notifier;

pub const RETRY_TITLE: &str = "File Retry Triggered";

#[derive(Clone)]
pub struct Admin {
    store: Arc<dyn StatusStore>,
    broker: Arc<dyn StreamBroker>,
    notifier: Arc<dyn Notifier>,
}

impl Admin {
    pub fn new(store: Arc<dyn StatusStore>, broker: Arc<dyn StreamBroker>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            broker,
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    /// Put a file back at `queued` with a clean slate and restart it
    pub async fn retry(&self, filename: &str) -> Result<()> {
        if !self.store.reset_file(filename).await? {
            return Err(Error::NotFound(format!("File {} not found in pipeline", filename)));
        }

        self.notifier
            .notify(RETRY_TITLE, &format!("File {} reset to queued.", filename))
            .await;

        let id = self
            .broker
            .publish(STREAM_QUEUED, &WorkMessage::new(filename))
            .await?;
        info!(file = filename, message_id = %id, "File reset and requeued");
        Ok(())
    }

    /// Forget every file record and retry counter. Artifacts on disk stay.
    pub async fn purge_all(&self) -> Result<u64> {
        let removed = self.store.purge_all().await?;
        warn!(removed, "Purged all file records");
        Ok(removed)
    }
}
