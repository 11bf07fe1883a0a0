//! Alert delivery: always a `tracing` event, plus a webhook POST when configured.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{error, warn};

use super::{Alert, AlertLevel, AlertSink};
use crate::errors::GuardError;

pub struct WebhookAlertSink {
    http: Client,
    webhook_url: Option<String>,
}

impl WebhookAlertSink {
    pub fn new(webhook_url: Option<String>) -> Result<Self, GuardError> {
        let http = Client::builder().timeout(Duration::from_secs(5)).build()?;
        Ok(Self { http, webhook_url })
    }

    pub fn is_webhook_enabled(&self) -> bool {
        self.webhook_url.is_some()
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn alert(&self, alert: &Alert) -> Result<(), GuardError> {
        match alert.level {
            AlertLevel::Critical => error!(title = %alert.title, body = %alert.body, "ALERT"),
            AlertLevel::Warning => warn!(title = %alert.title, body = %alert.body, "alert"),
        }

        let Some(url) = self.webhook_url.as_deref() else {
            return Ok(());
        };

        let payload = json!({
            "level": alert.level,
            "title": alert.title,
            "text": format!("[{}] {}", alert.title, alert.body),
            "timestamp": alert.timestamp,
        });

        let resp = self
            .http
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| GuardError::AlertDelivery {
                reason: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(GuardError::AlertDelivery {
                reason: format!("webhook returned {}", resp.status()),
            });
        }
        Ok(())
    }
}
