//! HTTP telemetry feed.
//!
//! `GET telemetry_url` returning `{drawdown_pct, leverage, positions}`. A 503
//! or a body with `"status": "unavailable"` is an explicit outage; a missing
//! field is a failure, never a zero.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::TelemetrySource;
use crate::errors::GuardError;
use crate::types::{RawTelemetry, TelemetrySnapshot};

pub struct HttpTelemetrySource {
    http: Client,
    url: String,
}

impl HttpTelemetrySource {
    /// The per-request timeout is a backstop; the monitor applies its own
    /// configured timeout around every fetch.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, GuardError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl TelemetrySource for HttpTelemetrySource {
    async fn fetch(&self) -> Result<TelemetrySnapshot, GuardError> {
        let resp = self.http.get(&self.url).send().await?;
        let status = resp.status();

        if status == StatusCode::SERVICE_UNAVAILABLE {
            return Err(GuardError::TelemetryUnavailable {
                reason: "telemetry endpoint returned 503".into(),
            });
        }
        if !status.is_success() {
            return Err(GuardError::TelemetryUnavailable {
                reason: format!("telemetry endpoint returned {status}"),
            });
        }

        let raw: RawTelemetry = resp.json().await?;
        let snapshot = raw.into_snapshot()?;
        debug!(
            drawdown_pct = %snapshot.drawdown_pct,
            leverage = %snapshot.leverage,
            symbols = snapshot.positions.len(),
            "telemetry fetched"
        );
        Ok(snapshot)
    }
}
