use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::GuardError;

/// Telemetry as it arrives from the execution/broker collaborator.
///
/// Every field is optional on the wire so that absence can be told apart from
/// a legitimate zero. A healthy account with no drawdown reports
/// `drawdown_pct: 0`, which must never be mistaken for "not supplied".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTelemetry {
    pub drawdown_pct: Option<Decimal>,
    pub leverage: Option<Decimal>,
    pub positions: Option<BTreeMap<String, Decimal>>,
    /// Explicit availability signal, e.g. `"unavailable"` while the broker reconnects.
    pub status: Option<String>,
}

impl RawTelemetry {
    /// Convert into a complete snapshot, or fail if anything is missing.
    pub fn into_snapshot(self) -> Result<TelemetrySnapshot, GuardError> {
        if let Some(status) = self.status.as_deref() {
            if status.eq_ignore_ascii_case("unavailable") {
                return Err(GuardError::TelemetryUnavailable {
                    reason: "collaborator reported unavailable".into(),
                });
            }
        }

        let mut missing = Vec::new();
        if self.drawdown_pct.is_none() {
            missing.push("drawdown_pct");
        }
        if self.leverage.is_none() {
            missing.push("leverage");
        }
        if self.positions.is_none() {
            missing.push("positions");
        }

        if let Some(positions) = &self.positions {
            if positions.keys().any(|symbol| symbol.trim().is_empty()) {
                return Err(GuardError::TelemetryUnavailable {
                    reason: "positions contain an empty symbol".into(),
                });
            }
        }

        match (self.drawdown_pct, self.leverage, self.positions) {
            (Some(drawdown_pct), Some(leverage), Some(positions)) => Ok(TelemetrySnapshot {
                drawdown_pct,
                leverage,
                positions,
            }),
            _ => Err(GuardError::TelemetryUnavailable {
                reason: format!("snapshot missing field(s): {}", missing.join(", ")),
            }),
        }
    }
}

/// A complete telemetry snapshot. Positions are keyed by symbol in sorted
/// order; exposure is expressed as a multiple of account equity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub drawdown_pct: Decimal,
    pub leverage: Decimal,
    pub positions: BTreeMap<String, Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_all_zero_snapshot_is_present() {
        let raw: RawTelemetry = serde_json::from_str(
            r#"{"drawdown_pct": 0, "leverage": 0, "positions": {}}"#,
        )
        .unwrap();
        let snap = raw.into_snapshot().expect("zeros are valid values");
        assert_eq!(snap.drawdown_pct, Decimal::ZERO);
        assert_eq!(snap.leverage, Decimal::ZERO);
        assert!(snap.positions.is_empty());
    }

    #[test]
    fn test_missing_fields_are_reported() {
        let raw: RawTelemetry = serde_json::from_str(r#"{"leverage": 2}"#).unwrap();
        let err = raw.into_snapshot().expect_err("missing fields must fail");
        let msg = err.to_string();
        assert!(msg.contains("drawdown_pct"));
        assert!(msg.contains("positions"));
        assert!(!msg.contains("leverage,"));
    }

    #[test]
    fn test_explicit_unavailable() {
        let raw: RawTelemetry = serde_json::from_str(
            r#"{"status": "unavailable", "drawdown_pct": 1, "leverage": 1, "positions": {}}"#,
        )
        .unwrap();
        assert!(matches!(
            raw.into_snapshot(),
            Err(GuardError::TelemetryUnavailable { .. })
        ));
    }

    #[test]
    fn test_blank_symbol_is_a_failure() {
        for body in [
            r#"{"drawdown_pct": 1, "leverage": 1, "positions": {"": 9}}"#,
            r#"{"drawdown_pct": 1, "leverage": 1, "positions": {"BTC": 1, "  ": 2}}"#,
        ] {
            let raw: RawTelemetry = serde_json::from_str(body).unwrap();
            let err = raw.into_snapshot().unwrap_err();
            assert!(err.to_string().contains("empty symbol"), "got {err}");
        }
    }

    #[test]
    fn test_decimal_values_parse_from_numbers_and_strings() {
        let raw: RawTelemetry = serde_json::from_str(
            r#"{"drawdown_pct": "4.5", "leverage": 2.25, "positions": {"BTC": 1.5}}"#,
        )
        .unwrap();
        let snap = raw.into_snapshot().unwrap();
        assert_eq!(snap.drawdown_pct, dec!(4.5));
        assert_eq!(snap.leverage, dec!(2.25));
        assert_eq!(snap.positions["BTC"], dec!(1.5));
    }
}
