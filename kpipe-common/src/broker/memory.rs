//! In-process Stream Broker for single-process runs and tests

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{MessageId, StreamBroker, StreamMessage, WorkMessage};
use crate::{Error, Result};

#[derive(Default)]
struct GroupState {
    last_delivered: i64,
    /// message id -> (consumer, delivery count)
    pending: BTreeMap<i64, (String, u32)>,
}

#[derive(Default)]
struct TopicState {
    messages: Vec<(i64, WorkMessage)>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    topics: HashMap<String, TopicState>,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
    published: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Internal("memory broker lock poisoned".to_string()))
    }

    /// Every message ever published to `topic`, in order
    pub fn messages(&self, topic: &str) -> Vec<WorkMessage> {
        self.lock()
            .map(|inner| {
                inner
                    .topics
                    .get(topic)
                    .map(|t| t.messages.iter().map(|(_, m)| m.clone()).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    fn claim(&self, topic: &str, group: &str, consumer: &str, count: usize) -> Result<Vec<StreamMessage>> {
        let mut inner = self.lock()?;
        let state = inner
            .topics
            .get_mut(topic)
            .ok_or_else(|| Error::NotFound(format!("No group {} on topic {}", group, topic)))?;
        let TopicState { messages, groups } = state;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| Error::NotFound(format!("No group {} on topic {}", group, topic)))?;

        let mut batch = Vec::new();
        for (id, message) in messages.iter() {
            if batch.len() >= count {
                break;
            }
            if *id <= group_state.last_delivered {
                continue;
            }
            group_state.last_delivered = *id;
            group_state.pending.insert(*id, (consumer.to_string(), 1));
            batch.push(StreamMessage {
                id: MessageId(*id),
                message: message.clone(),
                delivery_count: 1,
            });
        }
        Ok(batch)
    }
}

#[async_trait]
impl StreamBroker for MemoryBroker {
    async fn publish(&self, topic: &str, message: &WorkMessage) -> Result<MessageId> {
        let id = {
            let mut inner = self.lock()?;
            inner.next_id += 1;
            let id = inner.next_id;
            inner
                .topics
                .entry(topic.to_string())
                .or_default()
                .messages
                .push((id, message.clone()));
            id
        };
        self.published.notify_waiters();
        Ok(MessageId(id))
    }

    async fn ensure_group(&self, topic: &str, group: &str) -> Result<()> {
        let mut inner = self.lock()?;
        inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn read_batch(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_timeout: Duration,
    ) -> Result<Vec<StreamMessage>> {
        let deadline = Instant::now() + block_timeout;
        loop {
            // Register interest before checking so a publish in between is not lost
            let notified = self.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.claim(topic, group, consumer, count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    async fn read_pending(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>> {
        let mut inner = self.lock()?;
        let Some(state) = inner.topics.get_mut(topic) else {
            return Ok(Vec::new());
        };
        let TopicState { messages, groups } = state;
        let Some(group_state) = groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let mut batch = Vec::new();
        for (id, (owner, deliveries)) in group_state.pending.iter_mut() {
            if batch.len() >= count {
                break;
            }
            if owner != consumer {
                continue;
            }
            let Some((_, message)) = messages.iter().find(|(mid, _)| mid == id) else {
                continue;
            };
            *deliveries += 1;
            batch.push(StreamMessage {
                id: MessageId(*id),
                message: message.clone(),
                delivery_count: *deliveries,
            });
        }
        Ok(batch)
    }

    async fn ack(&self, topic: &str, group: &str, id: MessageId) -> Result<bool> {
        let mut inner = self.lock()?;
        Ok(inner
            .topics
            .get_mut(topic)
            .and_then(|t| t.groups.get_mut(group))
            .map(|g| g.pending.remove(&id.0).is_some())
            .unwrap_or(false))
    }

    async fn pending_count(&self, topic: &str, group: &str) -> Result<u64> {
        let inner = self.lock()?;
        Ok(inner
            .topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .map(|g| g.pending.len() as u64)
            .unwrap_or(0))
    }

    async fn topic_len(&self, topic: &str) -> Result<u64> {
        let inner = self.lock()?;
        Ok(inner.topics.get(topic).map(|t| t.messages.len() as u64).unwrap_or(0))
    }
}
