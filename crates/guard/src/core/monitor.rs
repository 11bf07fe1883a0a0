//! Risk monitor poll loop.
//!
//! Each cycle:
//! 1. fetch telemetry under the configured timeout
//! 2. if the breaker is already OPEN, record and skip evaluation
//! 3. otherwise evaluate limits and policies in fixed priority order
//! 4. on a violation, trip (alert + at most one liquidation directive)
//! 5. append exactly one evidence record
//!
//! Consecutive telemetry failures reaching the configured threshold trip the
//! breaker defensively. Shutdown is observed only while waiting on telemetry
//! or sleeping, so a cycle that has begun evaluating always completes.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::breaker::TripOutcome;
use super::evaluator;
use super::evidence::EvidenceRecord;
use super::kill_switch::KillSwitch;
use crate::config::{ConfigHandle, RiskLimitsConfig};
use crate::errors::GuardError;
use crate::execution::TelemetrySource;
use crate::loader::PolicyModule;
use crate::types::{Decision, TelemetrySnapshot, TripReason};

/// What one cycle decided. Mirrors the evidence record it wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    pub decision: Decision,
    pub trip_reason: Option<TripReason>,
    pub breaker_open: bool,
    pub evidence_written: bool,
}

pub struct RiskMonitor {
    kill_switch: Arc<KillSwitch>,
    telemetry: Arc<dyn TelemetrySource>,
    config: ConfigHandle,
    policies: Arc<[PolicyModule]>,
    shutdown: CancellationToken,
    consecutive_failures: AtomicU32,
    cycle: AtomicU64,
}

impl RiskMonitor {
    pub fn new(
        kill_switch: Arc<KillSwitch>,
        telemetry: Arc<dyn TelemetrySource>,
        config: ConfigHandle,
        policies: Vec<PolicyModule>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            kill_switch,
            telemetry,
            config,
            policies: policies.into(),
            shutdown,
            consecutive_failures: AtomicU32::new(0),
            cycle: AtomicU64::new(0),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Poll until the cancellation token fires.
    pub async fn run(&self) -> Result<()> {
        info!(policies = self.policies.len(), "risk monitor started");

        loop {
            let limits = self.config.snapshot();
            let fetched = tokio::select! {
                () = self.shutdown.cancelled() => break,
                fetched = self.fetch(&limits) => fetched,
            };

            let report = self.process(&limits, fetched).await;
            debug!(
                cycle = report.cycle,
                decision = ?report.decision,
                breaker_open = report.breaker_open,
                "cycle complete"
            );

            let interval = Duration::from_secs(limits.evaluation_interval_seconds);
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {}
            }
        }

        info!(cycles = self.cycle.load(Ordering::Relaxed), "risk monitor shutting down");
        Ok(())
    }

    /// One full cycle, ignoring cancellation.
    pub async fn run_cycle(&self) -> CycleReport {
        let limits = self.config.snapshot();
        let fetched = self.fetch(&limits).await;
        self.process(&limits, fetched).await
    }

    async fn fetch(&self, limits: &RiskLimitsConfig) -> Result<TelemetrySnapshot, GuardError> {
        let timeout = Duration::from_secs(limits.telemetry_timeout_seconds);
        match tokio::time::timeout(timeout, self.telemetry.fetch()).await {
            Ok(result) => result,
            Err(_) => Err(GuardError::TelemetryUnavailable {
                reason: format!("fetch timed out after {timeout:?}"),
            }),
        }
    }

    async fn process(
        &self,
        limits: &RiskLimitsConfig,
        fetched: Result<TelemetrySnapshot, GuardError>,
    ) -> CycleReport {
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed) + 1;
        let auto_liquidate = limits.auto_liquidation_enabled;

        // Track failures before anything else so a marker problem can't hide them.
        let failures = match &fetched {
            Ok(_) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                0
            }
            Err(_) => self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1,
        };

        let (decision, trip_reason, rationale, snapshot, open_after) =
            match self.kill_switch.check_open().await {
                Err(e) => {
                    error!(cycle, error = %e, "breaker marker unavailable");
                    let detail = self
                        .defensive_trip(TripReason::MarkerIo, fetched.as_ref().ok().cloned(), auto_liquidate)
                        .await;
                    (
                        Decision::DefensiveTrip,
                        Some(TripReason::MarkerIo),
                        format!("breaker marker unavailable: {e}; {detail}"),
                        fetched.ok(),
                        true,
                    )
                }
                Ok(true) => match fetched {
                    Ok(snapshot) => (
                        Decision::HaltedSkip,
                        None,
                        "breaker OPEN; evaluation skipped".to_string(),
                        Some(snapshot),
                        true,
                    ),
                    Err(e) => (
                        Decision::TelemetryFailure,
                        None,
                        format!("breaker OPEN; telemetry failure {failures}: {e}"),
                        None,
                        true,
                    ),
                },
                Ok(false) => match fetched {
                    Err(e) if failures >= limits.telemetry_failure_trip_threshold => {
                        warn!(cycle, failures, error = %e, "telemetry failure threshold reached");
                        let detail = self
                            .defensive_trip(TripReason::TelemetryUnavailable, None, auto_liquidate)
                            .await;
                        (
                            Decision::DefensiveTrip,
                            Some(TripReason::TelemetryUnavailable),
                            format!(
                                "{failures} consecutive telemetry failures (threshold {}): {e}; {detail}",
                                limits.telemetry_failure_trip_threshold
                            ),
                            None,
                            true,
                        )
                    }
                    Err(e) => {
                        warn!(cycle, failures, error = %e, "telemetry fetch failed");
                        (
                            Decision::TelemetryFailure,
                            None,
                            format!(
                                "telemetry failure {failures} of {}: {e}",
                                limits.telemetry_failure_trip_threshold
                            ),
                            None,
                            false,
                        )
                    }
                    Ok(snapshot) => {
                        match evaluator::evaluate(&snapshot, limits, &self.policies) {
                            None => (
                                Decision::Clean,
                                None,
                                "all limits within bounds".to_string(),
                                Some(snapshot),
                                false,
                            ),
                            Some(violation) => {
                                warn!(cycle, %violation, "risk limit breached");
                                let detail = match self
                                    .kill_switch
                                    .trip(violation.reason.clone(), Some(snapshot.clone()), auto_liquidate)
                                    .await
                                {
                                    Ok(TripOutcome::Tripped(_)) => "breaker tripped".to_string(),
                                    Ok(TripOutcome::AlreadyOpen(info)) => {
                                        format!("breaker already OPEN ({})", info.reason)
                                    }
                                    Err(e) => format!("marker write failed, latched OPEN: {e}"),
                                };
                                (
                                    Decision::Trip,
                                    Some(violation.reason.clone()),
                                    format!("{violation}; {detail}"),
                                    Some(snapshot),
                                    true,
                                )
                            }
                        }
                    }
                },
            };

        let mut record = EvidenceRecord::new(
            decision,
            rationale,
            if open_after { "open" } else { "closed" },
        )
        .with_cycle(cycle)
        .with_snapshot(snapshot)
        .with_thresholds(limits);
        if let Some(reason) = &trip_reason {
            record = record.with_reason(reason.clone());
        }

        let evidence_written = match self.kill_switch.record(record, auto_liquidate).await {
            Ok(()) => true,
            Err(e) => {
                error!(cycle, error = %e, "cycle evidence not recorded");
                false
            }
        };

        CycleReport {
            cycle,
            decision,
            trip_reason,
            breaker_open: open_after || !evidence_written,
            evidence_written,
        }
    }

    async fn defensive_trip(
        &self,
        reason: TripReason,
        metrics: Option<TelemetrySnapshot>,
        auto_liquidate: bool,
    ) -> String {
        match self.kill_switch.trip(reason, metrics, auto_liquidate).await {
            Ok(TripOutcome::Tripped(_)) => "defensive trip".to_string(),
            Ok(TripOutcome::AlreadyOpen(info)) => format!("breaker already OPEN ({})", info.reason),
            Err(e) => format!("marker write failed, latched OPEN: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Limits reload
// ---------------------------------------------------------------------------

/// Re-read, validate and swap in `limits.json` on every SIGHUP. An invalid
/// file is logged and the current limits stay in force.
#[cfg(unix)]
pub async fn reload_on_sighup(
    config: ConfigHandle,
    limits_path: PathBuf,
    shutdown: CancellationToken,
) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            received = hangup.recv() => {
                if received.is_none() {
                    break;
                }
                reload_limits(&config, &limits_path);
            }
        }
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn reload_on_sighup(
    _config: ConfigHandle,
    _limits_path: PathBuf,
    shutdown: CancellationToken,
) -> Result<()> {
    shutdown.cancelled().await;
    Ok(())
}

/// Validate and swap. Returns whether the new limits were applied.
pub fn reload_limits(config: &ConfigHandle, limits_path: &std::path::Path) -> bool {
    match crate::config::load_limits(limits_path) {
        Ok(limits) => {
            let previous = config.swap(limits);
            info!(
                path = %limits_path.display(),
                previous_drawdown_max_pct = %previous.drawdown_max_pct,
                drawdown_max_pct = %config.snapshot().drawdown_max_pct,
                "risk limits reloaded"
            );
            true
        }
        Err(e) => {
            error!(path = %limits_path.display(), error = %e, "limits reload rejected — keeping current limits");
            false
        }
    }
}
