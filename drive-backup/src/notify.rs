//! Job-completion notifications.
//!
//! The only sink is an optional webhook receiving `{"title", "message"}`.
//! A missing webhook is a silent no-op.

use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Posts notifications as JSON to a webhook URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Option<String>,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client, url: Option<String>) -> Self {
        Self {
            client,
            url: url.filter(|u| !u.trim().is_empty()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let Some(url) = &self.url else {
            return Ok(());
        };

        let resp = self
            .client
            .post(url)
            .timeout(WEBHOOK_TIMEOUT)
            .json(notification)
            .send()
            .await
            .map_err(|e| BackupError::Notification(format!("Webhook unreachable: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackupError::Notification(format!(
                "Webhook returned {}: {}",
                status, body
            )));
        }

        debug!(title = %notification.title, "Notification delivered");
        Ok(())
    }
}
