use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{error, info};

use super::ExecutionSink;
use crate::errors::GuardError;
use crate::types::LiquidationDirective;

/// Sends liquidation directives to the execution collaborator.
///
/// With no `execution_url` configured the directive is only logged, which
/// suits dry runs and deployments where execution tails the log.
pub struct HttpExecutionSink {
    http: Client,
    url: Option<String>,
}

impl HttpExecutionSink {
    pub fn new(url: Option<String>) -> Result<Self, GuardError> {
        let http = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { http, url })
    }
}

#[async_trait]
impl ExecutionSink for HttpExecutionSink {
    async fn dispatch(&self, directive: &LiquidationDirective) -> Result<(), GuardError> {
        let Some(url) = self.url.as_deref() else {
            error!(
                action = "halt_and_liquidate",
                reason = %directive.reason,
                timestamp = %directive.timestamp,
                "LIQUIDATION DIRECTIVE (no execution_url configured, logged only)"
            );
            return Ok(());
        };

        let resp = self
            .http
            .post(url)
            .json(directive)
            .send()
            .await
            .map_err(|e| GuardError::LiquidationDispatch {
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GuardError::LiquidationDispatch {
                reason: format!("execution endpoint returned {status}: {body}"),
            });
        }

        info!(reason = %directive.reason, "liquidation directive dispatched");
        Ok(())
    }
}
