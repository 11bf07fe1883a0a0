//! Boundaries to the external collaborators: telemetry in, liquidation
//! directives and alerts out.
//!
//! The monitor only sees the traits; the HTTP/log adapters here are the
//! production implementations.

pub mod liquidation;
pub mod notifier;
pub mod telemetry_client;

pub use liquidation::HttpExecutionSink;
pub use notifier::WebhookAlertSink;
pub use telemetry_client::HttpTelemetrySource;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::errors::GuardError;
use crate::types::{LiquidationDirective, TelemetrySnapshot};

/// Pull-based telemetry feed.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// One complete snapshot. Missing fields and explicit unavailability are errors.
    async fn fetch(&self) -> Result<TelemetrySnapshot, GuardError>;
}

/// Receiver of halt/liquidate directives.
#[async_trait]
pub trait ExecutionSink: Send + Sync {
    async fn dispatch(&self, directive: &LiquidationDirective) -> Result<(), GuardError>;
}

/// Receiver of operator-facing alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, alert: &Alert) -> Result<(), GuardError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub title: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn critical(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            level: AlertLevel::Critical,
            title: title.into(),
            body: body.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn warning(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            level: AlertLevel::Warning,
            title: title.into(),
            body: body.into(),
            timestamp: Utc::now(),
        }
    }
}
