use rust_decimal::Decimal;
use rust_decimal_macros::dec;

// ---------------------------------------------------------------------------
// Risk limit bounds
// ---------------------------------------------------------------------------

/// Inclusive bounds for `drawdown_max_pct` (percent of equity).
pub const DRAWDOWN_PCT_MIN: Decimal = dec!(0.1);
pub const DRAWDOWN_PCT_MAX: Decimal = dec!(50);

/// Inclusive bounds for `leverage_min` / `leverage_max`.
pub const LEVERAGE_FLOOR: Decimal = dec!(1);
pub const LEVERAGE_CEILING: Decimal = dec!(20);

/// Inclusive bounds for the poll interval.
pub const EVALUATION_INTERVAL_MIN_SECONDS: u64 = 1;
pub const EVALUATION_INTERVAL_MAX_SECONDS: u64 = 3_600;

/// Inclusive bounds for consecutive telemetry failures before a defensive trip.
pub const TELEMETRY_TRIP_THRESHOLD_MIN: u32 = 1;
pub const TELEMETRY_TRIP_THRESHOLD_MAX: u32 = 100;

/// Inclusive bounds and default for the telemetry fetch timeout.
pub const TELEMETRY_TIMEOUT_MIN_SECONDS: u64 = 1;
pub const TELEMETRY_TIMEOUT_MAX_SECONDS: u64 = 60;
pub const DEFAULT_TELEMETRY_TIMEOUT_SECONDS: u64 = 5;

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Marker schema version written by this build. Unknown versions read as OPEN.
pub const MARKER_SCHEMA_VERSION: u32 = 1;

pub const DEFAULT_MARKER_CACHE_TTL_MS: u64 = 1_000;
pub const DEFAULT_MARKER_IO_TIMEOUT_MS: u64 = 2_000;

/// Attempts per evidence record before the write is considered persistent failure.
pub const EVIDENCE_WRITE_ATTEMPTS: u32 = 3;

/// Hex length of a SHA-256 digest.
pub const SHA256_HEX_LEN: usize = 64;
