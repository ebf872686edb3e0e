// =============================================================================
// Notification Sinks — operator channels for pause/trade alerts
// =============================================================================
//
// Sinks are best-effort: a dead webhook never blocks or crashes the trading
// path. Failures are logged and swallowed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;
    async fn send_message(&self, text: &str) -> anyhow::Result<()>;
}

/// Generic JSON webhook sink (Slack/Discord/Telegram-style relay).
pub struct WebhookSink {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client builds with static settings"),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_message(&self, text: &str) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "text": text }))
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("webhook returned {}", response.status());
        }
        Ok(())
    }
}

/// All configured sinks; `notify_all` fans out best-effort.
#[derive(Default)]
pub struct NotifierRegistry {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl NotifierRegistry {
    pub fn from_urls(urls: &[String]) -> Self {
        let sinks = urls
            .iter()
            .enumerate()
            .filter(|(_, url)| !url.trim().is_empty())
            .map(|(i, url)| {
                Arc::new(WebhookSink::new(format!("webhook-{i}"), url.clone()))
                    as Arc<dyn NotificationSink>
            })
            .collect();
        Self { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn NotificationSink>) {
        self.sinks.push(sink);
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub async fn notify_all(&self, text: &str) {
        for sink in &self.sinks {
            match sink.send_message(text).await {
                Ok(()) => debug!(sink = sink.name(), "notification sent"),
                Err(e) => warn!(sink = sink.name(), error = %e, "notification failed (non-fatal)"),
            }
        }
    }
}
