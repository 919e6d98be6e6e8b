//! Best-effort operator notifications
//!
//! A notifier never fails its caller: delivery problems are logged and
//! dropped so they cannot block pipeline progress.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

const USER_AGENT: &str = concat!("kpipe-worker/", env!("CARGO_PKG_VERSION"));

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, title: &str, message: &str);
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, title: &str, message: &str) {
        info!(title, "{}", message);
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    title: &'a str,
    message: &'a str,
}

/// POSTs `{title, message}` JSON to one URL
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    http_client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            url: url.into(),
            http_client,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, title: &str, message: &str) {
        let result = self
            .http_client
            .post(&self.url)
            .json(&WebhookPayload { title, message })
            .send()
            .await
            .and_then(|response| response.error_for_status());

        if let Err(e) = result {
            warn!(url = %self.url, title, "Notification delivery failed: {}", e);
        }
    }
}

/// Delivers to every inner notifier concurrently
#[derive(Clone, Default)]
pub struct FanoutNotifier {
    targets: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(targets: Vec<Arc<dyn Notifier>>) -> Self {
        Self { targets }
    }

    /// Log notifier plus one webhook notifier per URL
    pub fn from_config(config: &kpipe_common::config::NotifyConfig) -> Self {
        let mut targets: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
        let timeout = Duration::from_millis(config.timeout_ms);
        for url in &config.webhooks {
            match WebhookNotifier::new(url.clone(), timeout) {
                Ok(webhook) => targets.push(Arc::new(webhook)),
                Err(e) => warn!(url = %url, "Skipping webhook notifier: {}", e),
            }
        }
        Self { targets }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, title: &str, message: &str) {
        futures::future::join_all(self.targets.iter().map(|t| t.notify(title, message))).await;
    }
}

/// A delivered notification, as captured by `MemoryNotifier`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub message: String,
}

/// Keeps every notification in memory (single-process runs and tests)
#[derive(Debug, Clone, Default)]
pub struct MemoryNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Notifications whose title equals `title`
    pub fn count_titled(&self, title: &str) -> usize {
        self.sent().iter().filter(|n| n.title == title).count()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, title: &str, message: &str) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(Notification {
                title: title.to_string(),
                message: message.to_string(),
            });
        }
    }
}
