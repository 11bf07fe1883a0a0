//! Async front for the breaker: moves marker and evidence I/O onto the
//! blocking pool under a timeout, and fans trip/reset side effects out to the
//! execution and alert collaborators.
//!
//! Used by the monitor for cycle-driven trips and by the CLI for manual trips
//! and resets.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::breaker::{BreakerState, CircuitBreaker, ResetOutcome, TripInfo, TripOutcome};
use super::evidence::{EvidenceLogger, EvidenceRecord};
use crate::config::RiskLimitsConfig;
use crate::errors::GuardError;
use crate::execution::{Alert, AlertSink, ExecutionSink};
use crate::types::{Decision, LiquidationDirective, TelemetrySnapshot, TripReason};

pub struct KillSwitch {
    breaker: Arc<CircuitBreaker>,
    evidence: EvidenceLogger,
    execution: Arc<dyn ExecutionSink>,
    alerts: Arc<dyn AlertSink>,
    io_timeout: Duration,
}

impl KillSwitch {
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        evidence: EvidenceLogger,
        execution: Arc<dyn ExecutionSink>,
        alerts: Arc<dyn AlertSink>,
        io_timeout: Duration,
    ) -> Self {
        Self {
            breaker,
            evidence,
            execution,
            alerts,
            io_timeout,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    // -----------------------------------------------------------------------
    // Marker access
    // -----------------------------------------------------------------------

    /// Whether trading is halted, including an in-process latch.
    ///
    /// A latched trip is written to the marker here on every call until the
    /// marker takes it, so other processes see OPEN once storage recovers.
    pub async fn check_open(&self) -> Result<bool, GuardError> {
        if self.breaker.is_latched() {
            let breaker = Arc::clone(&self.breaker);
            if let Err(e) = self
                .marker_op("persist", move || breaker.persist_pending())
                .await
            {
                warn!(error = %e, "latched trip still not persisted");
            }
            return Ok(true);
        }

        let breaker = Arc::clone(&self.breaker);
        self.marker_op("state", move || {
            Ok(breaker.is_latched() || breaker.state()?.is_open())
        })
        .await
    }

    /// Fresh marker read, bypassing the cache.
    pub async fn state(&self) -> Result<BreakerState, GuardError> {
        let breaker = Arc::clone(&self.breaker);
        self.marker_op("refresh", move || breaker.refresh()).await
    }

    /// Trip the breaker and, on a real CLOSED → OPEN transition, alert and
    /// (if enabled) emit exactly one liquidation directive.
    ///
    /// A failed write still halts (latched in-process) and liquidates. A write
    /// that outlives the I/O timeout is latched and alerted at once; its
    /// directive waits for the write to settle, so a trip that lands on an
    /// already OPEN marker never liquidates twice.
    ///
    /// Evidence is the caller's job: the monitor folds the trip into its
    /// cycle record.
    pub async fn trip(
        &self,
        reason: TripReason,
        metrics: Option<TelemetrySnapshot>,
        auto_liquidate: bool,
    ) -> Result<TripOutcome, GuardError> {
        let trip = TripInfo {
            reason: reason.clone(),
            timestamp: Utc::now(),
            metrics,
        };
        let breaker = Arc::clone(&self.breaker);
        let attempt = trip.clone();
        let mut handle = tokio::task::spawn_blocking(move || breaker.trip_with(attempt));

        let result = match tokio::time::timeout(self.io_timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(self.marker_error(format!("trip task failed: {join}"))),
            Err(_) => {
                let e = self.marker_error(format!("trip timed out after {:?}", self.io_timeout));
                // A settled write already cleared or set the latch itself.
                if !handle.is_finished() {
                    self.breaker.latch(trip);
                }
                self.send_alert(Alert::critical(
                    "circuit breaker trip not persisted",
                    format!("reason: {reason}; marker error: {e}; latched OPEN in-process"),
                ))
                .await;
                if auto_liquidate {
                    self.dispatch_when_settled(handle, reason);
                }
                return Err(e);
            }
        };

        match &result {
            Ok(TripOutcome::Tripped(info)) => {
                self.send_alert(Alert::critical(
                    "circuit breaker tripped",
                    format!("reason: {} at {}", info.reason, info.timestamp),
                ))
                .await;
                if auto_liquidate {
                    self.dispatch(LiquidationDirective::halt_and_liquidate(
                        info.reason.clone(),
                        Utc::now(),
                    ))
                    .await;
                }
            }
            Ok(TripOutcome::AlreadyOpen(_)) => {}
            Err(e) => {
                self.breaker.latch(trip);
                self.send_alert(Alert::critical(
                    "circuit breaker trip not persisted",
                    format!("reason: {reason}; marker error: {e}; latched OPEN in-process"),
                ))
                .await;
                if auto_liquidate {
                    self.dispatch(LiquidationDirective::halt_and_liquidate(reason, Utc::now()))
                        .await;
                }
            }
        }
        result
    }

    /// Operator-initiated trip from outside the monitor loop. Always recorded.
    pub async fn manual_trip(
        &self,
        note: &str,
        limits: &RiskLimitsConfig,
    ) -> Result<TripOutcome, GuardError> {
        let reason = TripReason::Manual {
            note: note.to_string(),
        };
        let outcome = self
            .trip(reason.clone(), None, limits.auto_liquidation_enabled)
            .await?;

        let rationale = match &outcome {
            TripOutcome::Tripped(_) => format!("manual trip: {reason}"),
            TripOutcome::AlreadyOpen(info) => {
                format!("manual trip requested while already OPEN ({})", info.reason)
            }
        };
        let record = EvidenceRecord::new(Decision::ManualTrip, rationale, "open")
            .with_thresholds(limits)
            .with_reason(reason);
        self.record(record, limits.auto_liquidation_enabled).await?;
        Ok(outcome)
    }

    /// OPEN → CLOSED by an authorized operator. Unauthorized attempts are
    /// logged and alerted but never touch the marker.
    pub async fn reset(
        &self,
        operator: &str,
        justification: &str,
        limits: &RiskLimitsConfig,
    ) -> Result<ResetOutcome, GuardError> {
        let breaker = Arc::clone(&self.breaker);
        let (op, why) = (operator.to_string(), justification.to_string());
        let result = self.marker_op("reset", move || breaker.reset(&op, &why)).await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e @ GuardError::Unauthorized { .. }) => {
                self.send_alert(Alert::warning(
                    "breaker reset rejected",
                    format!("operator '{operator}': {e}"),
                ))
                .await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if let ResetOutcome::Reset(cleared) = &outcome {
            let cleared_reason = cleared.as_ref().map(|c| c.reason.to_string());
            let mut record = EvidenceRecord::new(
                Decision::Reset,
                format!(
                    "reset by {operator}; cleared trip: {}",
                    cleared_reason.as_deref().unwrap_or("unknown")
                ),
                "closed",
            )
            .with_thresholds(limits)
            .with_operator(operator, justification);
            if let Some(info) = cleared {
                record = record
                    .with_reason(info.reason.clone())
                    .with_snapshot(info.metrics.clone());
            }
            self.record(record, limits.auto_liquidation_enabled).await?;

            self.send_alert(Alert::warning(
                "circuit breaker reset",
                format!("operator: {operator}; justification: {justification}"),
            ))
            .await;
        }
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Evidence
    // -----------------------------------------------------------------------

    /// Append an evidence record. A persistent failure trips the breaker
    /// with `evidence_unavailable` and is returned to the caller.
    pub async fn record(
        &self,
        record: EvidenceRecord,
        auto_liquidate: bool,
    ) -> Result<(), GuardError> {
        let logger = self.evidence.clone();
        let joined = tokio::time::timeout(
            self.io_timeout,
            tokio::task::spawn_blocking(move || logger.append(&record)),
        )
        .await;

        let result = match joined {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(GuardError::EvidenceWrite {
                attempts: 1,
                reason: format!("append task failed: {join}"),
            }),
            Err(_) => Err(GuardError::EvidenceWrite {
                attempts: 1,
                reason: format!("append timed out after {:?}", self.io_timeout),
            }),
        };

        if let Err(e) = &result {
            if e.is_safety_critical() {
                error!(error = %e, "evidence unavailable, tripping defensively");
                // The trip result is already alerted inside `trip`.
                let _ = self
                    .trip(TripReason::EvidenceUnavailable, None, auto_liquidate)
                    .await;
            }
        }
        result
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn marker_op<T, F>(&self, op: &'static str, f: F) -> Result<T, GuardError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, GuardError> + Send + 'static,
    {
        // A write whose timeout elapsed keeps running on the blocking pool
        // and still completes its rename; only the wait is abandoned.
        match tokio::time::timeout(self.io_timeout, tokio::task::spawn_blocking(f)).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(self.marker_error(format!("{op} task failed: {join}"))),
            Err(_) => Err(self.marker_error(format!(
                "{op} timed out after {:?}",
                self.io_timeout
            ))),
        }
    }

    fn marker_error(&self, reason: String) -> GuardError {
        GuardError::MarkerIo {
            path: self.breaker.store().path().display().to_string(),
            reason,
        }
    }

    async fn dispatch(&self, directive: LiquidationDirective) {
        dispatch_directive(self.execution.as_ref(), self.alerts.as_ref(), directive).await;
    }

    /// Liquidate once a timed-out trip settles, unless it found the breaker
    /// already OPEN.
    fn dispatch_when_settled(
        &self,
        handle: JoinHandle<Result<TripOutcome, GuardError>>,
        reason: TripReason,
    ) {
        let execution = Arc::clone(&self.execution);
        let alerts = Arc::clone(&self.alerts);
        tokio::spawn(async move {
            let reason = match handle.await {
                Ok(Ok(TripOutcome::AlreadyOpen(info))) => {
                    info!(existing = %info.reason, "late trip found breaker already OPEN; no directive");
                    return;
                }
                Ok(Ok(TripOutcome::Tripped(info))) => info.reason,
                Ok(Err(_)) | Err(_) => reason,
            };
            dispatch_directive(
                execution.as_ref(),
                alerts.as_ref(),
                LiquidationDirective::halt_and_liquidate(reason, Utc::now()),
            )
            .await;
        });
    }

    async fn send_alert(&self, alert: Alert) {
        send_alert(self.alerts.as_ref(), alert).await;
    }
}

async fn dispatch_directive(
    execution: &dyn ExecutionSink,
    alerts: &dyn AlertSink,
    directive: LiquidationDirective,
) {
    match execution.dispatch(&directive).await {
        Ok(()) => info!(reason = %directive.reason, "halt_and_liquidate directive emitted"),
        Err(e) => {
            error!(error = %e, "liquidation directive dispatch failed");
            send_alert(
                alerts,
                Alert::critical(
                    "liquidation directive dispatch failed",
                    format!("reason: {}; error: {e}", directive.reason),
                ),
            )
            .await;
        }
    }
}

async fn send_alert(alerts: &dyn AlertSink, alert: Alert) {
    if let Err(e) = alerts.alert(&alert).await {
        warn!(title = %alert.title, error = %e, "alert delivery failed");
    }
}
