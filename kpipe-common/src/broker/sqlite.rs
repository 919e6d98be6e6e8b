//! SQLite-backed Stream Broker
//!
//! Topics live in one append-only table. A group's cursor is advanced with a
//! compare-and-set so two consumers in different processes cannot claim the
//! same message. Readers in other processes are discovered by polling; readers
//! in this process are also woken directly on publish.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{MessageId, StreamBroker, StreamMessage, WorkMessage};
use crate::db::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};
use crate::{Error, Result};

/// Poll interval while blocked in `read_batch`
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct SqliteBroker {
    pool: SqlitePool,
    poll_interval: Duration,
    max_lock_wait_ms: u64,
    published: Arc<Notify>,
}

impl SqliteBroker {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_lock_wait_ms: DEFAULT_MAX_LOCK_WAIT_MS,
            published: Arc::new(Notify::new()),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Hand the next `count` undelivered messages to `consumer`.
    /// Returns an empty batch when nothing is waiting.
    async fn claim(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>> {
        let pool = &self.pool;
        let limit = count as i64;

        retry_on_lock("stream_claim", self.max_lock_wait_ms, move || async move {
            loop {
                let mut tx = pool.begin().await?;

                let last: Option<i64> = sqlx::query_scalar(
                    "SELECT last_delivered_id FROM stream_groups WHERE topic = ? AND group_name = ?",
                )
                .bind(topic)
                .bind(group)
                .fetch_optional(&mut *tx)
                .await?;
                let last = last.ok_or_else(|| {
                    Error::NotFound(format!("No group {} on topic {}", group, topic))
                })?;

                let rows = sqlx::query(
                    "SELECT id, payload FROM stream_messages WHERE topic = ? AND id > ? ORDER BY id LIMIT ?",
                )
                .bind(topic)
                .bind(last)
                .bind(limit)
                .fetch_all(&mut *tx)
                .await?;

                let Some(newest) = rows.last().map(|r| r.get::<i64, _>("id")) else {
                    tx.rollback().await?;
                    return Ok(Vec::new());
                };

                let advanced = sqlx::query(
                    r#"
                    UPDATE stream_groups SET last_delivered_id = ?
                    WHERE topic = ? AND group_name = ? AND last_delivered_id = ?
                    "#,
                )
                .bind(newest)
                .bind(topic)
                .bind(group)
                .bind(last)
                .execute(&mut *tx)
                .await?
                .rows_affected();

                if advanced == 0 {
                    // Another consumer claimed these first; look again
                    tx.rollback().await?;
                    debug!(topic, group, consumer, "Lost claim race, retrying");
                    continue;
                }

                let now = Utc::now().to_rfc3339();
                let mut batch = Vec::with_capacity(rows.len());
                for row in &rows {
                    let id: i64 = row.get("id");
                    let payload: String = row.get("payload");

                    sqlx::query(
                        r#"
                        INSERT OR REPLACE INTO stream_pending
                            (topic, group_name, message_id, consumer, delivery_count, delivered_at)
                        VALUES (?, ?, ?, ?, 1, ?)
                        "#,
                    )
                    .bind(topic)
                    .bind(group)
                    .bind(id)
                    .bind(consumer)
                    .bind(&now)
                    .execute(&mut *tx)
                    .await?;

                    match serde_json::from_str::<WorkMessage>(&payload) {
                        Ok(message) => batch.push(StreamMessage {
                            id: MessageId(id),
                            message,
                            delivery_count: 1,
                        }),
                        Err(e) => {
                            // Stays pending; nothing useful can consume it
                            warn!(topic, id, "Skipping undecodable stream payload: {}", e);
                        }
                    }
                }

                tx.commit().await?;
                return Ok(batch);
            }
        })
        .await
    }
}

#[async_trait]
impl StreamBroker for SqliteBroker {
    async fn publish(&self, topic: &str, message: &WorkMessage) -> Result<MessageId> {
        let pool = &self.pool;
        let payload = serde_json::to_string(message)?;
        let payload = payload.as_str();

        let id: i64 = retry_on_lock("stream_publish", self.max_lock_wait_ms, move || async move {
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO stream_messages (topic, payload, created_at) VALUES (?, ?, ?) RETURNING id",
            )
            .bind(topic)
            .bind(payload)
            .bind(Utc::now().to_rfc3339())
            .fetch_one(pool)
            .await?;
            Ok(id)
        })
        .await?;

        self.published.notify_waiters();
        debug!(topic, id, file = %message.file, "Published");
        Ok(MessageId(id))
    }

    async fn ensure_group(&self, topic: &str, group: &str) -> Result<()> {
        let pool = &self.pool;

        retry_on_lock("stream_ensure_group", self.max_lock_wait_ms, move || async move {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO stream_groups (topic, group_name, last_delivered_id, created_at)
                VALUES (?, ?, 0, ?)
                "#,
            )
            .bind(topic)
            .bind(group)
            .bind(Utc::now().to_rfc3339())
            .execute(pool)
            .await?;
            Ok(())
        })
        .await
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
            let notified = self.published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.claim(topic, group, consumer, count).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wait = self.poll_interval.min(deadline - now);

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
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
        let pool = &self.pool;
        let limit = count as i64;

        retry_on_lock("stream_read_pending", self.max_lock_wait_ms, move || async move {
            let mut tx = pool.begin().await?;

            let rows = sqlx::query(
                r#"
                SELECT m.id, m.payload, p.delivery_count
                FROM stream_pending p
                JOIN stream_messages m ON m.id = p.message_id
                WHERE p.topic = ? AND p.group_name = ? AND p.consumer = ?
                ORDER BY m.id
                LIMIT ?
                "#,
            )
            .bind(topic)
            .bind(group)
            .bind(consumer)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await?;

            let now = Utc::now().to_rfc3339();
            let mut batch = Vec::with_capacity(rows.len());
            for row in &rows {
                let id: i64 = row.get("id");
                let payload: String = row.get("payload");
                let deliveries: i64 = row.get("delivery_count");

                sqlx::query(
                    r#"
                    UPDATE stream_pending SET delivery_count = delivery_count + 1, delivered_at = ?
                    WHERE topic = ? AND group_name = ? AND message_id = ?
                    "#,
                )
                .bind(&now)
                .bind(topic)
                .bind(group)
                .bind(id)
                .execute(&mut *tx)
                .await?;

                match serde_json::from_str::<WorkMessage>(&payload) {
                    Ok(message) => batch.push(StreamMessage {
                        id: MessageId(id),
                        message,
                        delivery_count: (deliveries + 1).max(0) as u32,
                    }),
                    Err(e) => warn!(topic, id, "Skipping undecodable pending payload: {}", e),
                }
            }

            tx.commit().await?;
            Ok(batch)
        })
        .await
    }

    async fn ack(&self, topic: &str, group: &str, id: MessageId) -> Result<bool> {
        let pool = &self.pool;

        retry_on_lock("stream_ack", self.max_lock_wait_ms, move || async move {
            let removed = sqlx::query(
                "DELETE FROM stream_pending WHERE topic = ? AND group_name = ? AND message_id = ?",
            )
            .bind(topic)
            .bind(group)
            .bind(id.0)
            .execute(pool)
            .await?
            .rows_affected();
            Ok(removed > 0)
        })
        .await
    }

    async fn pending_count(&self, topic: &str, group: &str) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM stream_pending WHERE topic = ? AND group_name = ?",
        )
        .bind(topic)
        .bind(group)
        .fetch_one(&self.pool)
        .await?;
        Ok(n.max(0) as u64)
    }

    async fn topic_len(&self, topic: &str) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stream_messages WHERE topic = ?")
            .bind(topic)
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }
}
