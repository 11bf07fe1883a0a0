use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Why the breaker tripped.
///
/// Stored in the marker and the evidence log as a flat snake_case string
/// (`drawdown`, `symbol_exposure:BTC`, `policy:desk_caps/eth_cap`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum TripReason {
    Drawdown,
    Leverage,
    SymbolExposure { symbol: String },
    Policy { module: String, rule: String },
    /// Defensive: consecutive telemetry failures reached the threshold.
    TelemetryUnavailable,
    /// Defensive: the evidence log cannot be written.
    EvidenceUnavailable,
    /// Defensive: the breaker marker cannot be read or written.
    MarkerIo,
    /// Operator-initiated trip from outside the monitor.
    Manual { note: String },
}

impl TripReason {
    /// Defensive trips are caused by loss of visibility, not an observed breach.
    pub fn is_defensive(&self) -> bool {
        matches!(
            self,
            TripReason::TelemetryUnavailable | TripReason::EvidenceUnavailable | TripReason::MarkerIo
        )
    }
}

impl fmt::Display for TripReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TripReason::Drawdown => write!(f, "drawdown"),
            TripReason::Leverage => write!(f, "leverage"),
            TripReason::SymbolExposure { symbol } => write!(f, "symbol_exposure:{symbol}"),
            TripReason::Policy { module, rule } => write!(f, "policy:{module}/{rule}"),
            TripReason::TelemetryUnavailable => write!(f, "telemetry_unavailable"),
            TripReason::EvidenceUnavailable => write!(f, "evidence_unavailable"),
            TripReason::MarkerIo => write!(f, "marker_io"),
            TripReason::Manual { note } if note.is_empty() => write!(f, "manual"),
            TripReason::Manual { note } => write!(f, "manual:{note}"),
        }
    }
}

impl FromStr for TripReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, detail) = match s.split_once(':') {
            Some((kind, detail)) => (kind, Some(detail)),
            None => (s, None),
        };
        match (kind, detail) {
            ("drawdown", None) => Ok(TripReason::Drawdown),
            ("leverage", None) => Ok(TripReason::Leverage),
            ("telemetry_unavailable", None) => Ok(TripReason::TelemetryUnavailable),
            ("evidence_unavailable", None) => Ok(TripReason::EvidenceUnavailable),
            ("marker_io", None) => Ok(TripReason::MarkerIo),
            ("manual", note) => Ok(TripReason::Manual {
                note: note.unwrap_or_default().to_string(),
            }),
            ("symbol_exposure", Some(symbol)) => Ok(TripReason::SymbolExposure {
                symbol: symbol.to_string(),
            }),
            ("policy", Some(detail)) => match detail.split_once('/') {
                Some((module, rule)) if !module.is_empty() && !rule.is_empty() => {
                    Ok(TripReason::Policy {
                        module: module.to_string(),
                        rule: rule.to_string(),
                    })
                }
                _ => Err(format!("malformed policy trip reason: {s}")),
            },
            _ => Err(format!("unknown trip reason: {s}")),
        }
    }
}

impl From<TripReason> for String {
    fn from(reason: TripReason) -> Self {
        reason.to_string()
    }
}

impl TryFrom<String> for TripReason {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A single threshold breach found during evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub reason: TripReason,
    pub observed: Decimal,
    pub limit: Decimal,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: observed {} exceeds limit {}", self.reason, self.observed, self.limit)
    }
}

/// Outcome recorded for one evidence entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Telemetry evaluated, no threshold breached.
    Clean,
    /// A threshold breach tripped the breaker.
    Trip,
    /// Breaker already OPEN; evaluation skipped.
    HaltedSkip,
    /// Telemetry fetch failed below the trip threshold.
    TelemetryFailure,
    /// Breaker tripped because risk visibility was lost.
    DefensiveTrip,
    /// Breaker tripped by an explicit operator signal.
    ManualTrip,
    /// Breaker reset by an authorized operator.
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveAction {
    HaltAndLiquidate,
}

/// Instruction sent to the execution collaborator when the breaker trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationDirective {
    pub action: DirectiveAction,
    pub reason: TripReason,
    pub timestamp: DateTime<Utc>,
}

impl LiquidationDirective {
    pub fn halt_and_liquidate(reason: TripReason, timestamp: DateTime<Utc>) -> Self {
        Self {
            action: DirectiveAction::HaltAndLiquidate,
            reason,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trip_reason_wire_strings() {
        assert_eq!(TripReason::Drawdown.to_string(), "drawdown");
        assert_eq!(
            TripReason::TelemetryUnavailable.to_string(),
            "telemetry_unavailable"
        );
        assert_eq!(
            TripReason::SymbolExposure {
                symbol: "ETH".into()
            }
            .to_string(),
            "symbol_exposure:ETH"
        );
        assert_eq!(
            TripReason::Manual {
                note: String::new()
            }
            .to_string(),
            "manual"
        );
    }

    #[test]
    fn test_trip_reason_parses_back() {
        for s in [
            "drawdown",
            "leverage",
            "marker_io",
            "symbol_exposure:SOL",
            "policy:desk_caps/eth_cap",
            "manual:fat finger",
        ] {
            let reason: TripReason = s.parse().unwrap();
            assert_eq!(reason.to_string(), s);
        }
        assert!("policy:nomodule".parse::<TripReason>().is_err());
        assert!("meteor".parse::<TripReason>().is_err());
    }

    #[test]
    fn test_any_symbol_survives_serde() {
        for symbol in ["", " ", "BTC:PERP", "eth"] {
            let reason = TripReason::SymbolExposure {
                symbol: symbol.to_string(),
            };
            let json = serde_json::to_string(&reason).unwrap();
            let back: TripReason = serde_json::from_str(&json).unwrap();
            assert_eq!(back, reason);
        }
    }

    #[test]
    fn test_directive_json_shape() {
        let ts = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let directive = LiquidationDirective::halt_and_liquidate(TripReason::Drawdown, ts);
        let json = serde_json::to_value(&directive).unwrap();
        assert_eq!(json["action"], "halt_and_liquidate");
        assert_eq!(json["reason"], "drawdown");
        assert_eq!(json["timestamp"], "2026-01-02T03:04:05Z");
    }

    #[test]
    fn test_defensive_classification() {
        assert!(TripReason::TelemetryUnavailable.is_defensive());
        assert!(TripReason::MarkerIo.is_defensive());
        assert!(!TripReason::Drawdown.is_defensive());
    }
}
