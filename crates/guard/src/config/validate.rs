use std::path::Path;

use rust_decimal::Decimal;

use super::types::{AppConfig, RawRiskLimits, RiskLimitsConfig};
use crate::constants::{
    DEFAULT_TELEMETRY_TIMEOUT_SECONDS, DRAWDOWN_PCT_MAX, DRAWDOWN_PCT_MIN,
    EVALUATION_INTERVAL_MAX_SECONDS, EVALUATION_INTERVAL_MIN_SECONDS, LEVERAGE_CEILING,
    LEVERAGE_FLOOR, TELEMETRY_TIMEOUT_MAX_SECONDS, TELEMETRY_TIMEOUT_MIN_SECONDS,
    TELEMETRY_TRIP_THRESHOLD_MAX, TELEMETRY_TRIP_THRESHOLD_MIN,
};
use crate::errors::GuardError;

const DEFAULT_EVALUATION_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_TELEMETRY_FAILURE_TRIP_THRESHOLD: u32 = 3;

/// Validate raw risk limits into an immutable [`RiskLimitsConfig`].
///
/// Pure: no I/O, no logging. Every field is checked and all violations are
/// returned together in one [`GuardError::Config`]. Optional fields are
/// defaulted only when absent; a supplied value is always range-checked, so a
/// supplied `0` is an error rather than "not set".
pub fn validate_limits(raw: &RawRiskLimits) -> Result<RiskLimitsConfig, GuardError> {
    let mut errors: Vec<String> = Vec::new();

    // -- Drawdown -----------------------------------------------------------
    match raw.drawdown_max_pct {
        None => errors.push("drawdown_max_pct: missing".into()),
        Some(v) if v < DRAWDOWN_PCT_MIN || v > DRAWDOWN_PCT_MAX => errors.push(format!(
            "drawdown_max_pct ({v}) must be in [{DRAWDOWN_PCT_MIN}, {DRAWDOWN_PCT_MAX}]"
        )),
        Some(_) => {}
    }

    // -- Leverage -----------------------------------------------------------
    let leverage_min = raw.leverage_min.unwrap_or(LEVERAGE_FLOOR);
    check_leverage_bound("leverage_min", leverage_min, &mut errors);

    match raw.leverage_max {
        None => errors.push("leverage_max: missing".into()),
        Some(max) => {
            check_leverage_bound("leverage_max", max, &mut errors);
            if leverage_min > max {
                errors.push(format!(
                    "leverage_min ({leverage_min}) must be <= leverage_max ({max})"
                ));
            }
        }
    }

    if raw.auto_liquidation_enabled.is_none() {
        errors.push("auto_liquidation_enabled: missing".into());
    }

    // -- Timing -------------------------------------------------------------
    let interval = raw
        .evaluation_interval_seconds
        .unwrap_or(DEFAULT_EVALUATION_INTERVAL_SECONDS);
    if !(EVALUATION_INTERVAL_MIN_SECONDS..=EVALUATION_INTERVAL_MAX_SECONDS).contains(&interval) {
        errors.push(format!(
            "evaluation_interval_seconds ({interval}) must be in [{EVALUATION_INTERVAL_MIN_SECONDS}, {EVALUATION_INTERVAL_MAX_SECONDS}]"
        ));
    }

    let threshold = raw
        .telemetry_failure_trip_threshold
        .unwrap_or(DEFAULT_TELEMETRY_FAILURE_TRIP_THRESHOLD);
    if !(TELEMETRY_TRIP_THRESHOLD_MIN..=TELEMETRY_TRIP_THRESHOLD_MAX).contains(&threshold) {
        errors.push(format!(
            "telemetry_failure_trip_threshold ({threshold}) must be in [{TELEMETRY_TRIP_THRESHOLD_MIN}, {TELEMETRY_TRIP_THRESHOLD_MAX}]"
        ));
    }

    let timeout = raw
        .telemetry_timeout_seconds
        .unwrap_or(DEFAULT_TELEMETRY_TIMEOUT_SECONDS);
    if !(TELEMETRY_TIMEOUT_MIN_SECONDS..=TELEMETRY_TIMEOUT_MAX_SECONDS).contains(&timeout) {
        errors.push(format!(
            "telemetry_timeout_seconds ({timeout}) must be in [{TELEMETRY_TIMEOUT_MIN_SECONDS}, {TELEMETRY_TIMEOUT_MAX_SECONDS}]"
        ));
    }

    // -- Per-symbol overrides -----------------------------------------------
    let allow_loosening = raw.allow_override_loosening.unwrap_or(false);
    for (symbol, ovr) in &raw.symbol_overrides {
        if symbol.trim().is_empty() {
            errors.push("symbol_overrides: symbol name must not be empty".into());
            continue;
        }
        let Some(cap) = ovr.leverage_max else {
            continue;
        };
        let field = format!("symbol_overrides.{symbol}.leverage_max");
        check_leverage_bound(&field, cap, &mut errors);
        if cap < leverage_min {
            errors.push(format!(
                "{field} ({cap}) must be >= leverage_min ({leverage_min})"
            ));
        }
        if let Some(global) = raw.leverage_max {
            if cap > global && !allow_loosening {
                errors.push(format!(
                    "{field} ({cap}) loosens global leverage_max ({global}); set allow_override_loosening to permit"
                ));
            }
        }
    }

    if !errors.is_empty() {
        return Err(GuardError::Config { violations: errors });
    }

    // All required fields were checked for presence above.
    match (
        raw.drawdown_max_pct,
        raw.leverage_max,
        raw.auto_liquidation_enabled,
    ) {
        (Some(drawdown_max_pct), Some(leverage_max), Some(auto_liquidation_enabled)) => {
            Ok(RiskLimitsConfig {
                drawdown_max_pct,
                leverage_min,
                leverage_max,
                auto_liquidation_enabled,
                symbol_overrides: raw.symbol_overrides.clone(),
                evaluation_interval_seconds: interval,
                telemetry_failure_trip_threshold: threshold,
                telemetry_timeout_seconds: timeout,
                allow_override_loosening: allow_loosening,
            })
        }
        _ => Err(GuardError::Config {
            violations: vec!["required field missing".into()],
        }),
    }
}

fn check_leverage_bound(field: &str, value: Decimal, errors: &mut Vec<String>) {
    if value < LEVERAGE_FLOOR || value > LEVERAGE_CEILING {
        errors.push(format!(
            "{field} ({value}) must be in [{LEVERAGE_FLOOR}, {LEVERAGE_CEILING}]"
        ));
    }
}

// ---------------------------------------------------------------------------
// App config
// ---------------------------------------------------------------------------

/// Check the deployment section, appending to `errors`.
pub fn validate_app(app: &AppConfig, errors: &mut Vec<String>) {
    let paths = [
        ("marker_path", &app.marker_path),
        ("evidence_path", &app.evidence_path),
        ("manifest_path", &app.manifest_path),
    ];
    for (name, path) in paths {
        if path.as_os_str().is_empty() {
            errors.push(format!("app.{name}: must be set"));
        }
    }

    if !app.marker_path.as_os_str().is_empty() && app.marker_path == app.evidence_path {
        errors.push("app: marker_path and evidence_path must differ".into());
    }

    if app.marker_io_timeout_ms == 0 {
        errors.push("app.marker_io_timeout_ms: must be > 0".into());
    }

    if app.authorized_operators.iter().any(|op| op.trim().is_empty()) {
        errors.push("app.authorized_operators: entries must not be empty".into());
    }

    if app.logging.log_dir.is_empty() {
        errors.push("app.logging.log_dir: must be set".into());
    }

    if !crate::logging::is_valid_filter(&app.logging.filter) {
        errors.push(format!(
            "app.logging.filter: '{}' is not a valid filter directive",
            app.logging.filter
        ));
    }

    if let Some(reason) = world_writable_parent(&app.marker_path) {
        errors.push(format!("app.marker_path: {reason}"));
    }
}

/// Refuse marker locations any local user could replace.
#[cfg(unix)]
fn world_writable_parent(path: &Path) -> Option<String> {
    use std::os::unix::fs::PermissionsExt;

    let parent = path.parent().filter(|p| !p.as_os_str().is_empty())?;
    let meta = std::fs::metadata(parent).ok()?;
    if meta.permissions().mode() & 0o002 != 0 {
        Some(format!(
            "parent directory {} is world-writable",
            parent.display()
        ))
    } else {
        None
    }
}

#[cfg(not(unix))]
fn world_writable_parent(_path: &Path) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::SymbolOverride;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn valid_raw() -> RawRiskLimits {
        RawRiskLimits {
            drawdown_max_pct: Some(dec!(10)),
            leverage_min: Some(dec!(1)),
            leverage_max: Some(dec!(5)),
            auto_liquidation_enabled: Some(true),
            symbol_overrides: Default::default(),
            evaluation_interval_seconds: Some(30),
            telemetry_failure_trip_threshold: Some(3),
            telemetry_timeout_seconds: Some(5),
            allow_override_loosening: None,
        }
    }

    fn violations(raw: &RawRiskLimits) -> Vec<String> {
        match validate_limits(raw) {
            Err(GuardError::Config { violations }) => violations,
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        let cfg = validate_limits(&valid_raw()).expect("valid config");
        assert_eq!(cfg.drawdown_max_pct, dec!(10));
        assert_eq!(cfg.leverage_max, dec!(5));
        assert!(cfg.auto_liquidation_enabled);
        assert!(!cfg.allow_override_loosening);
    }

    #[test]
    fn test_minimal_config_takes_defaults() {
        let raw = RawRiskLimits {
            drawdown_max_pct: Some(dec!(10)),
            leverage_max: Some(dec!(5)),
            auto_liquidation_enabled: Some(false),
            ..Default::default()
        };
        let cfg = validate_limits(&raw).unwrap();
        assert_eq!(cfg.leverage_min, dec!(1));
        assert_eq!(cfg.evaluation_interval_seconds, 60);
        assert_eq!(cfg.telemetry_failure_trip_threshold, 3);
        assert_eq!(cfg.telemetry_timeout_seconds, 5);
    }

    #[test]
    fn test_supplied_zero_is_not_treated_as_absent() {
        let mut raw = valid_raw();
        raw.telemetry_failure_trip_threshold = Some(0);
        raw.evaluation_interval_seconds = Some(0);
        let v = violations(&raw);
        assert_eq!(v.len(), 2);
        assert!(v[0].contains("evaluation_interval_seconds (0)"));
        assert!(v[1].contains("telemetry_failure_trip_threshold (0)"));
    }

    #[test]
    fn test_explicit_false_auto_liquidation_is_present() {
        let mut raw = valid_raw();
        raw.auto_liquidation_enabled = Some(false);
        let cfg = validate_limits(&raw).unwrap();
        assert!(!cfg.auto_liquidation_enabled);
    }

    #[test]
    fn test_every_violation_is_reported() {
        let raw = RawRiskLimits {
            drawdown_max_pct: Some(dec!(75)),
            leverage_min: Some(dec!(8)),
            leverage_max: Some(dec!(4)),
            auto_liquidation_enabled: None,
            telemetry_timeout_seconds: Some(600),
            ..Default::default()
        };
        let v = violations(&raw);
        assert!(v.iter().any(|e| e.starts_with("drawdown_max_pct")));
        assert!(v.iter().any(|e| e.contains("must be <= leverage_max")));
        assert!(v.iter().any(|e| e.starts_with("auto_liquidation_enabled")));
        assert!(v.iter().any(|e| e.starts_with("telemetry_timeout_seconds")));
        assert_eq!(v.len(), 4);
    }

    #[test]
    fn test_missing_required_fields() {
        let v = violations(&RawRiskLimits::default());
        assert!(v.contains(&"drawdown_max_pct: missing".to_string()));
        assert!(v.contains(&"leverage_max: missing".to_string()));
        assert!(v.contains(&"auto_liquidation_enabled: missing".to_string()));
    }

    #[test]
    fn test_override_tightening_accepted() {
        let mut raw = valid_raw();
        raw.symbol_overrides.insert(
            "DOGE".into(),
            SymbolOverride {
                leverage_max: Some(dec!(2)),
            },
        );
        let cfg = validate_limits(&raw).unwrap();
        assert_eq!(cfg.symbol_exposure_limit("DOGE"), dec!(2));
        assert_eq!(cfg.symbol_exposure_limit("BTC"), dec!(5));
    }

    #[test]
    fn test_override_loosening_requires_flag() {
        let mut raw = valid_raw();
        raw.symbol_overrides.insert(
            "BTC".into(),
            SymbolOverride {
                leverage_max: Some(dec!(8)),
            },
        );
        let v = violations(&raw);
        assert_eq!(v.len(), 1);
        assert!(v[0].contains("loosens global leverage_max"));

        raw.allow_override_loosening = Some(true);
        let cfg = validate_limits(&raw).unwrap();
        assert_eq!(cfg.symbol_exposure_limit("BTC"), dec!(8));
    }

    #[test]
    fn test_loosening_flag_still_respects_absolute_ceiling() {
        let mut raw = valid_raw();
        raw.allow_override_loosening = Some(true);
        raw.symbol_overrides.insert(
            "BTC".into(),
            SymbolOverride {
                leverage_max: Some(dec!(25)),
            },
        );
        let v = violations(&raw);
        assert!(v[0].contains("symbol_overrides.BTC.leverage_max (25) must be in [1, 20]"));
    }

    #[test]
    fn test_override_below_leverage_min_rejected() {
        let mut raw = valid_raw();
        raw.leverage_min = Some(dec!(2));
        raw.symbol_overrides.insert(
            "ETH".into(),
            SymbolOverride {
                leverage_max: Some(dec!(1.5)),
            },
        );
        let v = violations(&raw);
        assert!(v.iter().any(|e| e.contains(">= leverage_min")));
    }

    #[test]
    fn test_empty_symbol_rejected() {
        let mut raw = valid_raw();
        raw.symbol_overrides.insert(" ".into(), SymbolOverride::default());
        let v = violations(&raw);
        assert!(v[0].contains("symbol name must not be empty"));
    }

    proptest! {
        #[test]
        fn drawdown_out_of_range_always_fails(tenths in prop_oneof![0i64..1, 501i64..10_000]) {
            let mut raw = valid_raw();
            raw.drawdown_max_pct = Some(Decimal::new(tenths, 1));
            let v = violations(&raw);
            prop_assert!(v.iter().any(|e| e.starts_with("drawdown_max_pct")));
        }

        #[test]
        fn inverted_leverage_and_bad_drawdown_both_listed(
            min in 2u32..=20,
            gap in 1u32..=10,
            drawdown in 51u32..500,
        ) {
            let max = min.saturating_sub(gap).max(1);
            prop_assume!(max < min);
            let mut raw = valid_raw();
            raw.leverage_min = Some(Decimal::from(min));
            raw.leverage_max = Some(Decimal::from(max));
            raw.drawdown_max_pct = Some(Decimal::from(drawdown));
            let v = violations(&raw);
            prop_assert!(v.iter().any(|e| e.starts_with("drawdown_max_pct")));
            prop_assert!(v.iter().any(|e| e.contains("must be <= leverage_max")));
        }

        #[test]
        fn in_range_limits_always_pass(
            drawdown_tenths in 1i64..=500,
            min in 1u32..=20,
            extra in 0u32..=19,
        ) {
            let max = (min + extra).min(20);
            let mut raw = valid_raw();
            raw.drawdown_max_pct = Some(Decimal::new(drawdown_tenths, 1));
            raw.leverage_min = Some(Decimal::from(min));
            raw.leverage_max = Some(Decimal::from(max));
            prop_assert!(validate_limits(&raw).is_ok());
        }
    }
}
