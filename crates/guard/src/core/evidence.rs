//! Append-only evidence log (JSON Lines).
//!
//! One record per monitor cycle and one per breaker transition triggered
//! outside a cycle (manual trip, reset). Each record carries everything
//! needed to reconstruct the decision afterwards: the inputs, the thresholds
//! applied and the outcome. The running process never rewrites or deletes
//! lines.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::config::RiskLimitsConfig;
use crate::constants::EVIDENCE_WRITE_ATTEMPTS;
use crate::errors::GuardError;
use crate::types::{Decision, TelemetrySnapshot, TripReason};

/// Base delay between write attempts; multiplied by the attempt number.
const RETRY_BACKOFF: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub timestamp: DateTime<Utc>,
    /// Monitor cycle number; absent for out-of-cycle transitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<u64>,
    pub metric_snapshot: Option<TelemetrySnapshot>,
    pub thresholds_used: Option<RiskLimitsConfig>,
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trip_reason: Option<TripReason>,
    pub rationale: String,
    /// Breaker state after this record's decision was applied.
    pub breaker_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
}

impl EvidenceRecord {
    pub fn new(decision: Decision, rationale: impl Into<String>, breaker_state: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            cycle: None,
            metric_snapshot: None,
            thresholds_used: None,
            decision,
            trip_reason: None,
            rationale: rationale.into(),
            breaker_state: breaker_state.to_string(),
            operator: None,
            justification: None,
        }
    }

    pub fn with_cycle(mut self, cycle: u64) -> Self {
        self.cycle = Some(cycle);
        self
    }

    pub fn with_snapshot(mut self, snapshot: Option<TelemetrySnapshot>) -> Self {
        self.metric_snapshot = snapshot;
        self
    }

    pub fn with_thresholds(mut self, limits: &RiskLimitsConfig) -> Self {
        self.thresholds_used = Some(limits.clone());
        self
    }

    pub fn with_reason(mut self, reason: TripReason) -> Self {
        self.trip_reason = Some(reason);
        self
    }

    pub fn with_operator(mut self, operator: &str, justification: &str) -> Self {
        self.operator = Some(operator.to_string());
        self.justification = Some(justification.to_string());
        self
    }
}

/// Writer for the evidence file. Cheap to clone; holds only the path.
#[derive(Debug, Clone)]
pub struct EvidenceLogger {
    path: PathBuf,
}

impl EvidenceLogger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record, retrying transient failures.
    ///
    /// Blocking; async callers should run it on the blocking pool.
    pub fn append(&self, record: &EvidenceRecord) -> Result<(), GuardError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut last_error = String::new();
        for attempt in 1..=EVIDENCE_WRITE_ATTEMPTS {
            match self.write_line(&line) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        attempt,
                        error = %e,
                        "evidence write failed"
                    );
                    last_error = e.to_string();
                    if attempt < EVIDENCE_WRITE_ATTEMPTS {
                        std::thread::sleep(RETRY_BACKOFF * attempt);
                    }
                }
            }
        }

        error!(path = %self.path.display(), "evidence log unavailable");
        Err(GuardError::EvidenceWrite {
            attempts: EVIDENCE_WRITE_ATTEMPTS,
            reason: last_error,
        })
    }

    fn write_line(&self, line: &[u8]) -> std::io::Result<()> {
        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line)?;
        file.sync_data()
    }

    /// Read every record back. A missing file is an empty log.
    pub fn read_all(&self) -> Result<Vec<EvidenceRecord>, GuardError> {
        let file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }
}
