//! Circuit breaker (the kill switch).
//!
//! State lives in the marker file, not in this struct. Any process that
//! points at the same marker sees the same truth. The only in-memory state is
//! a short-lived read cache and a fail-closed latch holding a trip the marker
//! could not take yet; that trip is written as soon as the marker accepts it.
//! Trips and resets run under an advisory lock on `<marker>.lock`.
//! OPEN → CLOSED happens only through [`CircuitBreaker::reset`] by an
//! authorized operator.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use super::marker::{MarkerRecord, MarkerState, MarkerStore};
use crate::errors::GuardError;
use crate::types::{TelemetrySnapshot, TripReason};

/// Details captured when the breaker opened.
#[derive(Debug, Clone, PartialEq)]
pub struct TripInfo {
    pub reason: TripReason,
    pub timestamp: DateTime<Utc>,
    pub metrics: Option<TelemetrySnapshot>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BreakerState {
    Closed,
    Open(TripInfo),
}

impl BreakerState {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerState::Open(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open(_) => "open",
        }
    }

    fn from_record(record: Option<MarkerRecord>) -> Self {
        match record {
            Some(MarkerRecord {
                state: MarkerState::Open,
                reason: Some(reason),
                timestamp,
                metrics,
                ..
            }) => BreakerState::Open(TripInfo {
                reason,
                timestamp,
                metrics,
            }),
            _ => BreakerState::Closed,
        }
    }
}

/// Result of a trip request.
#[derive(Debug, Clone, PartialEq)]
pub enum TripOutcome {
    /// This call moved the breaker CLOSED → OPEN.
    Tripped(TripInfo),
    /// The breaker was already OPEN; nothing was written.
    AlreadyOpen(TripInfo),
}

/// Result of a reset request.
#[derive(Debug, Clone, PartialEq)]
pub enum ResetOutcome {
    /// OPEN → CLOSED. Carries the trip that was cleared, if it was readable.
    Reset(Option<TripInfo>),
    AlreadyClosed,
}

pub struct CircuitBreaker {
    store: MarkerStore,
    cache_ttl: Duration,
    cache: Mutex<Option<(Instant, BreakerState)>>,
    /// A trip that has not reached the marker yet. Holds the breaker OPEN in
    /// this process until it is persisted or an operator resets.
    pending: Mutex<Option<TripInfo>>,
    authorized_operators: Vec<String>,
}

impl CircuitBreaker {
    pub fn new(store: MarkerStore, cache_ttl: Duration, authorized_operators: Vec<String>) -> Self {
        Self {
            store,
            cache_ttl,
            cache: Mutex::new(None),
            pending: Mutex::new(None),
            authorized_operators,
        }
    }

    pub fn store(&self) -> &MarkerStore {
        &self.store
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Current state, served from cache if younger than the TTL.
    pub fn state(&self) -> Result<BreakerState, GuardError> {
        if let Ok(cache) = self.cache.lock() {
            if let Some((at, state)) = cache.as_ref() {
                if at.elapsed() < self.cache_ttl {
                    return Ok(state.clone());
                }
            }
        }
        self.refresh()
    }

    /// Read the marker, bypassing the cache.
    pub fn refresh(&self) -> Result<BreakerState, GuardError> {
        let state = BreakerState::from_record(self.store.read()?);
        self.remember(&state);
        Ok(state)
    }

    /// Whether trading is halted. Fail-closed: an unreadable marker or a
    /// latched unpersisted trip both count as OPEN.
    pub fn is_open(&self) -> bool {
        if self.is_latched() {
            return true;
        }
        match self.state() {
            Ok(state) => state.is_open(),
            Err(e) => {
                error!(error = %e, "breaker marker unreadable, treating as OPEN");
                true
            }
        }
    }

    pub fn is_latched(&self) -> bool {
        self.pending_trip().is_some()
    }

    /// The latched trip still waiting to be written, if any.
    pub fn pending_trip(&self) -> Option<TripInfo> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Hold OPEN in this process until `trip` is persisted or a reset.
    /// The first latched trip wins.
    pub fn latch(&self, trip: TripInfo) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.is_none() {
            *pending = Some(trip);
        }
    }

    fn clear_latch(&self) {
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// CLOSED → OPEN. Idempotent: tripping an OPEN breaker reports
    /// [`TripOutcome::AlreadyOpen`] and leaves the marker untouched.
    pub fn trip(
        &self,
        reason: TripReason,
        metrics: Option<TelemetrySnapshot>,
    ) -> Result<TripOutcome, GuardError> {
        self.trip_with(TripInfo {
            reason,
            timestamp: Utc::now(),
            metrics,
        })
    }

    /// Trip with a caller-stamped [`TripInfo`].
    ///
    /// The marker is read and written under the cross-process lock, so of two
    /// concurrent trips exactly one reports `Tripped`. A corrupt marker is
    /// overwritten with a valid OPEN record. If the lock or the write fails
    /// the trip is latched for this process and the error is returned.
    pub fn trip_with(&self, trip: TripInfo) -> Result<TripOutcome, GuardError> {
        let result = self.store.with_lock(|| self.open_locked(&trip));
        if let Err(e) = &result {
            error!(reason = %trip.reason, error = %e, "trip could not be persisted; latched OPEN in-process");
            self.latch(trip);
        }
        result
    }

    /// Write a latched trip to the marker. `Ok(None)` when nothing is latched.
    ///
    /// On failure the latch stays and the caller retries later.
    pub fn persist_pending(&self) -> Result<Option<TripOutcome>, GuardError> {
        let Some(trip) = self.pending_trip() else {
            return Ok(None);
        };
        let outcome = self.store.with_lock(|| self.open_locked(&trip))?;
        if let TripOutcome::Tripped(info) = &outcome {
            info!(reason = %info.reason, since = %info.timestamp, "latched trip persisted to marker");
        }
        Ok(Some(outcome))
    }

    /// Caller holds the marker lock.
    fn open_locked(&self, trip: &TripInfo) -> Result<TripOutcome, GuardError> {
        match self.refresh() {
            Ok(BreakerState::Open(existing)) => {
                info!(existing = %existing.reason, requested = %trip.reason, "breaker already OPEN");
                self.clear_latch();
                return Ok(TripOutcome::AlreadyOpen(existing));
            }
            Ok(BreakerState::Closed) => {}
            Err(e) => warn!(error = %e, "marker unreadable during trip, overwriting"),
        }

        let record = MarkerRecord::open(trip.reason.clone(), trip.timestamp, trip.metrics.clone());
        self.store.write(&record)?;
        self.clear_latch();
        self.remember(&BreakerState::Open(trip.clone()));
        error!(reason = %trip.reason, marker = %self.store.path().display(), "BREAKER TRIPPED");
        Ok(TripOutcome::Tripped(trip.clone()))
    }

    /// OPEN → CLOSED, by an authorized operator with a justification.
    ///
    /// Unauthorized requests leave the marker untouched.
    pub fn reset(&self, operator: &str, justification: &str) -> Result<ResetOutcome, GuardError> {
        if !self.authorized_operators.iter().any(|op| op == operator) {
            warn!(operator, "reset rejected: operator not authorized");
            return Err(GuardError::Unauthorized {
                reason: format!("operator '{operator}' is not in authorized_operators"),
            });
        }
        if justification.trim().is_empty() {
            return Err(GuardError::Unauthorized {
                reason: "a justification is required".into(),
            });
        }

        self.store.with_lock(|| {
            let pending = self.pending_trip();
            let cleared = match self.refresh() {
                Ok(BreakerState::Closed) if pending.is_none() => {
                    return Ok(ResetOutcome::AlreadyClosed);
                }
                Ok(BreakerState::Closed) => pending,
                Ok(BreakerState::Open(info)) => Some(info),
                Err(e) => {
                    warn!(error = %e, "marker unreadable during reset, overwriting");
                    pending
                }
            };

            let record = MarkerRecord::closed_by(operator, justification, Utc::now());
            self.store.write(&record)?;
            self.clear_latch();
            self.remember(&BreakerState::Closed);

            info!(operator, justification, "breaker reset, trading permitted");
            Ok(ResetOutcome::Reset(cleared))
        })
    }

    fn remember(&self, state: &BreakerState) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some((Instant::now(), state.clone()));
        }
    }
}
