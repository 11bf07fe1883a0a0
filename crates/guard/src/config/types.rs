use std::collections::BTreeMap;
use std::path::PathBuf;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_MARKER_CACHE_TTL_MS, DEFAULT_MARKER_IO_TIMEOUT_MS};

// ---------------------------------------------------------------------------
// Top-level aggregate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub app: AppConfig,
    pub limits: RiskLimitsConfig,
}

// ---------------------------------------------------------------------------
// app.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub marker_path: PathBuf,
    pub evidence_path: PathBuf,
    pub manifest_path: PathBuf,
    #[serde(default = "default_marker_cache_ttl_ms")]
    pub marker_cache_ttl_ms: u64,
    #[serde(default = "default_marker_io_timeout_ms")]
    pub marker_io_timeout_ms: u64,
    #[serde(default)]
    pub authorized_operators: Vec<String>,
    #[serde(default)]
    pub telemetry_url: Option<String>,
    #[serde(default)]
    pub execution_url: Option<String>,
    #[serde(default)]
    pub alert_webhook_url: Option<String>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub log_dir: String,
    /// Filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "risk_guard=info,warn".to_string()
}

fn default_marker_cache_ttl_ms() -> u64 {
    DEFAULT_MARKER_CACHE_TTL_MS
}

fn default_marker_io_timeout_ms() -> u64 {
    DEFAULT_MARKER_IO_TIMEOUT_MS
}

// ---------------------------------------------------------------------------
// limits.json
// ---------------------------------------------------------------------------

/// Risk limits exactly as supplied. Every field is optional so the validator
/// can report "missing" separately from "out of range".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRiskLimits {
    pub drawdown_max_pct: Option<Decimal>,
    pub leverage_min: Option<Decimal>,
    pub leverage_max: Option<Decimal>,
    pub auto_liquidation_enabled: Option<bool>,
    #[serde(default)]
    pub symbol_overrides: BTreeMap<String, SymbolOverride>,
    pub evaluation_interval_seconds: Option<u64>,
    pub telemetry_failure_trip_threshold: Option<u32>,
    pub telemetry_timeout_seconds: Option<u64>,
    pub allow_override_loosening: Option<bool>,
}

/// Per-symbol exposure cap, as a multiple of equity. An override without a
/// value falls back to the global `leverage_max`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SymbolOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage_max: Option<Decimal>,
}

/// Validated, immutable risk policy. Built by [`super::validate::validate_limits`];
/// deserialized only when reading back evidence records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimitsConfig {
    pub drawdown_max_pct: Decimal,
    pub leverage_min: Decimal,
    pub leverage_max: Decimal,
    pub auto_liquidation_enabled: bool,
    pub symbol_overrides: BTreeMap<String, SymbolOverride>,
    pub evaluation_interval_seconds: u64,
    pub telemetry_failure_trip_threshold: u32,
    pub telemetry_timeout_seconds: u64,
    pub allow_override_loosening: bool,
}

impl RiskLimitsConfig {
    /// Exposure cap for a symbol: its override if present, else the global leverage cap.
    pub fn symbol_exposure_limit(&self, symbol: &str) -> Decimal {
        self.symbol_overrides
            .get(symbol)
            .and_then(|o| o.leverage_max)
            .unwrap_or(self.leverage_max)
    }
}
