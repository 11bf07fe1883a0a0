pub mod types;
pub mod validate;

pub use types::*;

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use tracing::info;

use crate::errors::GuardError;

/// Load `app.json` and `limits.json` from `config_dir`, apply environment
/// overrides, and validate both.
///
/// Expected directory layout:
/// ```text
/// config/
///   app.json
///   limits.json
///   manifest.json   (path referenced by app.json)
/// ```
///
/// # Environment variable overrides
///
/// | Env Var                  | Config Field             |
/// |--------------------------|--------------------------|
/// | `RISK_MARKER_PATH`       | `app.marker_path`        |
/// | `RISK_EVIDENCE_PATH`     | `app.evidence_path`      |
/// | `RISK_MANIFEST_PATH`     | `app.manifest_path`      |
/// | `RISK_TELEMETRY_URL`     | `app.telemetry_url`      |
/// | `RISK_EXECUTION_URL`     | `app.execution_url`      |
/// | `RISK_ALERT_WEBHOOK_URL` | `app.alert_webhook_url`  |
pub fn load_config(config_dir: &Path) -> Result<GuardConfig> {
    let app_path = config_dir.join("app.json");
    let contents = std::fs::read_to_string(&app_path)
        .with_context(|| format!("failed to read config file: {}", app_path.display()))?;
    let mut app: AppConfig = serde_json::from_str(&contents).context("parsing app.json")?;
    apply_env_overrides(&mut app);

    let raw = read_raw_limits(&config_dir.join("limits.json"))?;

    let mut errors = Vec::new();
    validate::validate_app(&app, &mut errors);
    let limits = match validate::validate_limits(&raw) {
        Ok(limits) if errors.is_empty() => limits,
        Ok(_) => return Err(GuardError::Config { violations: errors }.into()),
        Err(GuardError::Config { violations }) => {
            errors.extend(violations);
            return Err(GuardError::Config { violations: errors }.into());
        }
        Err(e) => return Err(e.into()),
    };

    Ok(GuardConfig { app, limits })
}

/// Read and validate a standalone `limits.json`. Used for reloads.
pub fn load_limits(path: &Path) -> Result<RiskLimitsConfig> {
    let raw = read_raw_limits(path)?;
    Ok(validate::validate_limits(&raw)?)
}

fn read_raw_limits(path: &Path) -> Result<RawRiskLimits> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
}

// ---------------------------------------------------------------------------
// Atomic snapshot handle
// ---------------------------------------------------------------------------

/// Shared holder for the current risk limits.
///
/// Readers take an `Arc` snapshot and keep it for a whole cycle; a reload
/// swaps the pointer, so nobody ever sees a half-updated config.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<RiskLimitsConfig>>>,
}

impl ConfigHandle {
    pub fn new(limits: RiskLimitsConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(limits))),
        }
    }

    pub fn snapshot(&self) -> Arc<RiskLimitsConfig> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Replace the current limits. Returns the previous snapshot.
    pub fn swap(&self, limits: RiskLimitsConfig) -> Arc<RiskLimitsConfig> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, Arc::new(limits))
    }
}

// ---------------------------------------------------------------------------
// Environment variable overrides
// ---------------------------------------------------------------------------

/// Only non-empty env vars take effect.
fn apply_env_overrides(app: &mut AppConfig) {
    if let Some(val) = env_path("RISK_MARKER_PATH") {
        info!(path = %val.display(), "env override: RISK_MARKER_PATH");
        app.marker_path = val;
    }

    if let Some(val) = env_path("RISK_EVIDENCE_PATH") {
        info!(path = %val.display(), "env override: RISK_EVIDENCE_PATH");
        app.evidence_path = val;
    }

    if let Some(val) = env_path("RISK_MANIFEST_PATH") {
        info!(path = %val.display(), "env override: RISK_MANIFEST_PATH");
        app.manifest_path = val;
    }

    if let Some(val) = env_string("RISK_TELEMETRY_URL") {
        info!("env override: RISK_TELEMETRY_URL");
        app.telemetry_url = Some(val);
    }

    if let Some(val) = env_string("RISK_EXECUTION_URL") {
        info!("env override: RISK_EXECUTION_URL");
        app.execution_url = Some(val);
    }

    if let Some(val) = env_string("RISK_ALERT_WEBHOOK_URL") {
        info!("env override: RISK_ALERT_WEBHOOK_URL");
        app.alert_webhook_url = Some(val);
    }
}

/// Read a non-empty env var as a `String`.
fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env_string(key).map(PathBuf::from)
}
