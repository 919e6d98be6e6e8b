//! Stream Broker
//!
//! Named append-only topics with consumer groups. Within a group every
//! message goes to exactly one consumer and stays pending until that
//! consumer acknowledges it (at-least-once). Order is append order within a
//! topic; nothing is promised across topics.

mod memory;
mod sqlite;

pub use memory::MemoryBroker;
pub use sqlite::SqliteBroker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::Result;

/// Broker-assigned, monotonically increasing within a broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Notification that `file` is ready for the consuming stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkMessage {
    pub file: String,
}

impl WorkMessage {
    pub fn new(file: impl Into<String>) -> Self {
        Self { file: file.into() }
    }
}

/// A message as handed to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: MessageId,
    pub message: WorkMessage,
    /// 1 on first delivery, higher when re-read from the pending list
    pub delivery_count: u32,
}

#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Append to `topic` (created on first use)
    async fn publish(&self, topic: &str, message: &WorkMessage) -> Result<MessageId>;

    /// Create `group` on `topic` starting from the beginning of the topic.
    /// Creating an existing group is not an error.
    async fn ensure_group(&self, topic: &str, group: &str) -> Result<()>;

    /// Up to `count` messages not yet delivered to the group, in append order.
    /// Waits at most `block_timeout` for one to appear; an empty batch on
    /// timeout is not an error. Delivered messages become pending for
    /// `consumer` until acknowledged.
    async fn read_batch(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_timeout: Duration,
    ) -> Result<Vec<StreamMessage>>;

    /// Messages already delivered to `consumer` but never acknowledged
    /// (the consumer died mid-attempt). Never blocks.
    async fn read_pending(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>>;

    /// Remove from the pending list. Returns false if it was not pending.
    async fn ack(&self, topic: &str, group: &str, id: MessageId) -> Result<bool>;

    /// Pending (delivered, unacknowledged) messages of a group
    async fn pending_count(&self, topic: &str, group: &str) -> Result<u64>;

    /// Total messages ever appended to `topic`
    async fn topic_len(&self, topic: &str) -> Result<u64>;
}
