//! Shared fixtures for the integration tests: scripted telemetry and
//! recording sinks.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use risk_guard::config::{ConfigHandle, RiskLimitsConfig};
use risk_guard::core::{CircuitBreaker, EvidenceLogger, KillSwitch, MarkerStore, RiskMonitor};
use risk_guard::errors::GuardError;
use risk_guard::execution::{Alert, AlertSink, ExecutionSink, TelemetrySource};
use risk_guard::loader::PolicyModule;
use risk_guard::types::{LiquidationDirective, TelemetrySnapshot};
use tokio_util::sync::CancellationToken;

pub const OPERATOR: &str = "alice";

pub fn limits() -> RiskLimitsConfig {
    RiskLimitsConfig {
        drawdown_max_pct: dec!(10),
        leverage_min: dec!(1),
        leverage_max: dec!(5),
        auto_liquidation_enabled: true,
        symbol_overrides: BTreeMap::new(),
        evaluation_interval_seconds: 1,
        telemetry_failure_trip_threshold: 3,
        telemetry_timeout_seconds: 5,
        allow_override_loosening: false,
    }
}

pub fn snapshot(drawdown: Decimal, leverage: Decimal) -> TelemetrySnapshot {
    TelemetrySnapshot {
        drawdown_pct: drawdown,
        leverage,
        positions: BTreeMap::new(),
    }
}

pub fn unavailable() -> Result<TelemetrySnapshot, GuardError> {
    Err(GuardError::TelemetryUnavailable {
        reason: "scripted outage".into(),
    })
}

// ---------------------------------------------------------------------------
// Collaborator doubles
// ---------------------------------------------------------------------------

/// Replays a fixed script; once exhausted, every fetch fails.
#[derive(Default)]
pub struct ScriptedTelemetry {
    script: Mutex<VecDeque<Result<TelemetrySnapshot, GuardError>>>,
}

impl ScriptedTelemetry {
    pub fn new(script: Vec<Result<TelemetrySnapshot, GuardError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
        }
    }
}

#[async_trait]
impl TelemetrySource for ScriptedTelemetry {
    async fn fetch(&self) -> Result<TelemetrySnapshot, GuardError> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(unavailable)
    }
}

/// Never answers; the monitor's fetch timeout has to cut it off.
pub struct SilentTelemetry;

#[async_trait]
impl TelemetrySource for SilentTelemetry {
    async fn fetch(&self) -> Result<TelemetrySnapshot, GuardError> {
        std::future::pending().await
    }
}

/// Records every directive it is handed. A rejecting sink records the
/// attempt and then fails it, like an execution endpoint that is down.
#[derive(Default)]
pub struct RecordingExecution {
    pub directives: Mutex<Vec<LiquidationDirective>>,
    reject: bool,
}

impl RecordingExecution {
    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ExecutionSink for RecordingExecution {
    async fn dispatch(&self, directive: &LiquidationDirective) -> Result<(), GuardError> {
        self.directives.lock().unwrap().push(directive.clone());
        if self.reject {
            return Err(GuardError::LiquidationDispatch {
                reason: "execution endpoint returned 502".into(),
            });
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingAlerts {
    pub alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerts {
    pub fn titles(&self) -> Vec<String> {
        self.alerts
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.title.clone())
            .collect()
    }
}

#[async_trait]
impl AlertSink for RecordingAlerts {
    async fn alert(&self, alert: &Alert) -> Result<(), GuardError> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub kill_switch: Arc<KillSwitch>,
    pub execution: Arc<RecordingExecution>,
    pub alerts: Arc<RecordingAlerts>,
    pub evidence: EvidenceLogger,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::in_dir(dir)
    }

    /// A fresh process over the same marker and evidence files.
    pub fn in_dir(dir: tempfile::TempDir) -> Self {
        Self::build(dir, RecordingExecution::default(), Duration::from_secs(2))
    }

    pub fn with_execution(execution: RecordingExecution) -> Self {
        Self::build(tempfile::tempdir().unwrap(), execution, Duration::from_secs(2))
    }

    pub fn with_io_timeout(io_timeout: Duration) -> Self {
        Self::build(
            tempfile::tempdir().unwrap(),
            RecordingExecution::default(),
            io_timeout,
        )
    }

    fn build(dir: tempfile::TempDir, execution: RecordingExecution, io_timeout: Duration) -> Self {
        let execution = Arc::new(execution);
        let alerts = Arc::new(RecordingAlerts::default());
        let evidence = EvidenceLogger::new(evidence_path(dir.path()));
        let kill_switch = Arc::new(KillSwitch::new(
            Arc::new(breaker(dir.path())),
            evidence.clone(),
            execution.clone(),
            alerts.clone(),
            io_timeout,
        ));
        Self {
            dir,
            kill_switch,
            execution,
            alerts,
            evidence,
        }
    }

    pub fn monitor(&self, telemetry: ScriptedTelemetry, limits: RiskLimitsConfig) -> RiskMonitor {
        self.monitor_with_policies(telemetry, limits, Vec::new())
    }

    pub fn monitor_with_policies(
        &self,
        telemetry: ScriptedTelemetry,
        limits: RiskLimitsConfig,
        policies: Vec<PolicyModule>,
    ) -> RiskMonitor {
        RiskMonitor::new(
            Arc::clone(&self.kill_switch),
            Arc::new(telemetry),
            ConfigHandle::new(limits),
            policies,
            CancellationToken::new(),
        )
    }

    pub fn monitor_with_source(
        &self,
        telemetry: Arc<dyn TelemetrySource>,
        limits: RiskLimitsConfig,
    ) -> RiskMonitor {
        RiskMonitor::new(
            Arc::clone(&self.kill_switch),
            telemetry,
            ConfigHandle::new(limits),
            Vec::new(),
            CancellationToken::new(),
        )
    }

    pub fn marker_path(&self) -> PathBuf {
        marker_path(self.dir.path())
    }

    pub fn directive_count(&self) -> usize {
        self.execution.directives.lock().unwrap().len()
    }

    pub fn evidence_lines(&self) -> usize {
        std::fs::read_to_string(self.evidence.path())
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    /// Consume the harness, keeping the directory for a "restarted" process.
    pub fn into_dir(self) -> tempfile::TempDir {
        self.dir
    }
}

/// The marker gets its own directory so tests can break it without
/// touching the evidence log.
pub fn marker_path(dir: &Path) -> PathBuf {
    dir.join("marker").join("breaker.json")
}

pub fn evidence_path(dir: &Path) -> PathBuf {
    dir.join("state").join("evidence.jsonl")
}

/// Cache disabled so every query hits the marker.
pub fn breaker(dir: &Path) -> CircuitBreaker {
    CircuitBreaker::new(
        MarkerStore::new(marker_path(dir)),
        Duration::ZERO,
        vec![OPERATOR.to_string()],
    )
}
