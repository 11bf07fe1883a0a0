use thiserror::Error;

/// Typed error hierarchy for the risk guard.
///
/// Library-internal errors use specific variants; application code wraps with
/// `anyhow::Context` for propagation.
#[derive(Error, Debug)]
pub enum GuardError {
    // -- Configuration ------------------------------------------------------
    #[error("{}", render_violations(.violations))]
    Config { violations: Vec<String> },

    // -- Module loading -----------------------------------------------------
    #[error("module manifest invalid: {reason}")]
    Manifest { reason: String },

    #[error("path violation for module '{module}': {reason}")]
    PathViolation { module: String, reason: String },

    #[error("integrity check failed for module '{module}': {reason}")]
    Integrity { module: String, reason: String },

    #[error("policy module '{module}' is malformed: {reason}")]
    Policy { module: String, reason: String },

    // -- Telemetry ----------------------------------------------------------
    #[error("telemetry unavailable: {reason}")]
    TelemetryUnavailable { reason: String },

    // -- Breaker marker -----------------------------------------------------
    #[error("breaker marker I/O failed at {path}: {reason}")]
    MarkerIo { path: String, reason: String },

    #[error("reset rejected: {reason}")]
    Unauthorized { reason: String },

    // -- Evidence -----------------------------------------------------------
    #[error("evidence write failed after {attempts} attempt(s): {reason}")]
    EvidenceWrite { attempts: u32, reason: String },

    // -- Execution ----------------------------------------------------------
    #[error("liquidation directive dispatch failed: {reason}")]
    LiquidationDispatch { reason: String },

    #[error("alert delivery failed: {reason}")]
    AlertDelivery { reason: String },

    // -- Forwarded errors ---------------------------------------------------
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn render_violations(violations: &[String]) -> String {
    format!(
        "configuration validation failed ({} error{}):\n  - {}",
        violations.len(),
        if violations.len() == 1 { "" } else { "s" },
        violations.join("\n  - ")
    )
}

impl GuardError {
    /// Whether this error should bias the breaker toward OPEN.
    pub fn is_safety_critical(&self) -> bool {
        matches!(
            self,
            GuardError::MarkerIo { .. } | GuardError::EvidenceWrite { .. }
        )
    }
}
