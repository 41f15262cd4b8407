//! Webhook notifier

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use super::{Notification, Notifier};
use crate::types::{DispatchError, Result};

#[derive(Debug, Clone)]
pub struct WebhookNotifierConfig {
    pub url: String,
    pub request_timeout: Duration,
}

impl WebhookNotifierConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    text: String,
    severity: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    chip_id: Option<&'a str>,
    notification: &'a Notification,
}

/// Posts notifications as JSON to a chat or incident webhook
pub struct WebhookNotifier {
    config: WebhookNotifierConfig,
    http_client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(config: WebhookNotifierConfig) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent("chip-dispatch/0.1")
            .build()
            .unwrap_or_default();
        Self {
            config,
            http_client,
        }
    }
}

/// Render a notification as plain text
pub fn render_text(n: &Notification) -> String {
    let mut text = format!("[{}] {}", n.severity.as_str().to_uppercase(), n.title);
    for line in &n.lines {
        text.push_str("\n- ");
        text.push_str(line);
    }
    text
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, n: &Notification) -> Result<()> {
        let payload = WebhookPayload {
            text: render_text(n),
            severity: n.severity.as_str(),
            chip_id: n.chip_id.as_deref(),
            notification: n,
        };
        let response = self
            .http_client
            .post(&self.config.url)
            .json(&payload)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Notifier(format!(
                "webhook returned {}",
                status
            )));
        }
        debug!(title = %n.title, "Webhook notification delivered");
        Ok(())
    }
}
