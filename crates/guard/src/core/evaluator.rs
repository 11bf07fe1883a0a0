//! Threshold evaluation.
//!
//! Pure functions: no I/O, no clock. Checks run in a fixed priority order so
//! the recorded trip reason is reproducible when several limits are breached
//! at once:
//!
//! 1. drawdown
//! 2. account leverage
//! 3. per-symbol exposure, ascending by symbol
//! 4. verified policy modules, by module name then rule order

use rust_decimal::Decimal;

use crate::config::RiskLimitsConfig;
use crate::loader::PolicyModule;
use crate::types::{TelemetrySnapshot, TripReason, Violation};

/// First violation found, or `None` for a clean snapshot.
///
/// A value equal to its limit is not a violation.
pub fn evaluate(
    snapshot: &TelemetrySnapshot,
    limits: &RiskLimitsConfig,
    policies: &[PolicyModule],
) -> Option<Violation> {
    check_drawdown(snapshot, limits)
        .or_else(|| check_leverage(snapshot, limits))
        .or_else(|| check_symbols(snapshot, limits))
        .or_else(|| policies.iter().find_map(|p| p.evaluate(snapshot)))
}

fn exceeds(reason: TripReason, observed: Decimal, limit: Decimal) -> Option<Violation> {
    (observed > limit).then_some(Violation {
        reason,
        observed,
        limit,
    })
}

fn check_drawdown(snapshot: &TelemetrySnapshot, limits: &RiskLimitsConfig) -> Option<Violation> {
    exceeds(
        TripReason::Drawdown,
        snapshot.drawdown_pct,
        limits.drawdown_max_pct,
    )
}

fn check_leverage(snapshot: &TelemetrySnapshot, limits: &RiskLimitsConfig) -> Option<Violation> {
    exceeds(TripReason::Leverage, snapshot.leverage, limits.leverage_max)
}

// BTreeMap iteration gives ascending symbol order.
fn check_symbols(snapshot: &TelemetrySnapshot, limits: &RiskLimitsConfig) -> Option<Violation> {
    snapshot.positions.iter().find_map(|(symbol, exposure)| {
        exceeds(
            TripReason::SymbolExposure {
                symbol: symbol.clone(),
            },
            exposure.abs(),
            limits.symbol_exposure_limit(symbol),
        )
    })
}
