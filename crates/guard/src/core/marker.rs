//! Persisted breaker marker.
//!
//! The marker file is the single source of truth for breaker state across
//! processes. Writes go to a uniquely named temporary file in the same
//! directory, are flushed to disk, then renamed over the marker, so readers
//! see either the old record or the new one and never a partial write.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::constants::MARKER_SCHEMA_VERSION;
use crate::errors::GuardError;
use crate::types::{TelemetrySnapshot, TripReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerState {
    Open,
    Closed,
}

/// On-disk marker content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerRecord {
    pub schema_version: u32,
    pub state: MarkerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<TripReason>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<TelemetrySnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
}

impl MarkerRecord {
    pub fn open(
        reason: TripReason,
        timestamp: DateTime<Utc>,
        metrics: Option<TelemetrySnapshot>,
    ) -> Self {
        Self {
            schema_version: MARKER_SCHEMA_VERSION,
            state: MarkerState::Open,
            reason: Some(reason),
            timestamp,
            metrics,
            reset_by: None,
            justification: None,
        }
    }

    pub fn closed_by(operator: &str, justification: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            schema_version: MARKER_SCHEMA_VERSION,
            state: MarkerState::Closed,
            reason: None,
            timestamp,
            metrics: None,
            reset_by: Some(operator.to_string()),
            justification: Some(justification.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarkerStore {
    path: PathBuf,
}

impl MarkerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the marker. `Ok(None)` means no marker exists.
    ///
    /// Anything else that is not a well-formed record of the current schema
    /// is an error; callers treat errors as OPEN.
    pub fn read(&self) -> Result<Option<MarkerRecord>, GuardError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(format!("read failed: {e}"))),
        };

        let record: MarkerRecord = serde_json::from_slice(&bytes)
            .map_err(|e| self.io_error(format!("unparseable marker: {e}")))?;

        if record.schema_version != MARKER_SCHEMA_VERSION {
            return Err(self.io_error(format!(
                "unsupported schema_version {} (expected {MARKER_SCHEMA_VERSION})",
                record.schema_version
            )));
        }
        if record.state == MarkerState::Open && record.reason.is_none() {
            return Err(self.io_error("open marker without a reason".into()));
        }

        Ok(Some(record))
    }

    /// Run `f` while holding an exclusive advisory lock on the sibling
    /// `<marker>.lock` file. Serializes read-modify-write transitions across
    /// processes; plain reads never take it.
    pub fn with_lock<T>(
        &self,
        f: impl FnOnce() -> Result<T, GuardError>,
    ) -> Result<T, GuardError> {
        let dir = self.dir();
        std::fs::create_dir_all(dir)
            .map_err(|e| self.io_error(format!("cannot create {}: {e}", dir.display())))?;

        let lock_path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)
            .map_err(|e| self.io_error(format!("cannot open {}: {e}", lock_path.display())))?;
        let mut lock = fd_lock::RwLock::new(file);
        let _guard = lock
            .write()
            .map_err(|e| self.io_error(format!("cannot lock {}: {e}", lock_path.display())))?;
        f()
    }

    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn dir(&self) -> &Path {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    /// Atomically replace the marker with `record`.
    pub fn write(&self, record: &MarkerRecord) -> Result<(), GuardError> {
        let body = serde_json::to_vec_pretty(record)
            .map_err(|e| self.io_error(format!("serialize failed: {e}")))?;

        let dir = self.dir();
        std::fs::create_dir_all(dir)
            .map_err(|e| self.io_error(format!("cannot create {}: {e}", dir.display())))?;

        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| self.io_error("marker path has no file name".into()))?;
        let tmp_path = dir.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

        if let Err(e) = write_synced(&tmp_path, &body) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(self.io_error(format!("temp write failed: {e}")));
        }
        if let Err(e) = std::fs::rename(&tmp_path, &self.path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(self.io_error(format!("rename failed: {e}")));
        }

        sync_dir(dir);
        Ok(())
    }

    fn io_error(&self, reason: String) -> GuardError {
        GuardError::MarkerIo {
            path: self.path.display().to_string(),
            reason,
        }
    }
}

fn write_synced(path: &Path, body: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(body)?;
    file.sync_all()
}

/// Persist the rename itself. Best effort: not every platform can fsync a directory.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        warn!(dir = %dir.display(), error = %e, "directory fsync after marker write failed");
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn store() -> (tempfile::TempDir, MarkerStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = MarkerStore::new(tmp.path().join("state").join("breaker.json"));
        (tmp, store)
    }

    #[test]
    fn test_absent_marker_reads_none() {
        let (_tmp, store) = store();
        assert_eq!(store.read().unwrap(), None);
    }

    #[test]
    fn test_write_then_read() {
        let (_tmp, store) = store();
        let metrics = TelemetrySnapshot {
            drawdown_pct: dec!(11),
            leverage: dec!(2),
            positions: BTreeMap::from([("BTC".to_string(), dec!(1.2))]),
        };
        let record = MarkerRecord::open(TripReason::Drawdown, Utc::now(), Some(metrics));
        store.write(&record).unwrap();
        assert_eq!(store.read().unwrap(), Some(record));
    }

    #[test]
    fn test_write_leaves_no_temp_files() {
        let (_tmp, store) = store();
        store
            .write(&MarkerRecord::open(TripReason::Leverage, Utc::now(), None))
            .unwrap();
        store
            .write(&MarkerRecord::closed_by("alice", "recovered", Utc::now()))
            .unwrap();
        let dir = store.path().parent().unwrap();
        let names: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["breaker.json".to_string()]);
    }

    #[test]
    fn test_marker_json_shape() {
        let (_tmp, store) = store();
        store
            .write(&MarkerRecord::open(TripReason::TelemetryUnavailable, Utc::now(), None))
            .unwrap();
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(raw["schema_version"], 1);
        assert_eq!(raw["state"], "open");
        assert_eq!(raw["reason"], "telemetry_unavailable");
        assert!(raw.get("metrics").is_none());
    }

    #[test]
    fn test_corrupt_marker_is_error() {
        let (_tmp, store) = store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), "{\"schema_version\": 1, \"state\": \"op").unwrap();
        assert!(matches!(store.read(), Err(GuardError::MarkerIo { .. })));
    }

    #[test]
    fn test_unknown_schema_version_is_error() {
        let (_tmp, store) = store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(
            store.path(),
            r#"{"schema_version": 99, "state": "closed", "timestamp": "2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let err = store.read().unwrap_err();
        assert!(err.to_string().contains("unsupported schema_version 99"));
    }

    #[test]
    fn test_open_without_reason_is_error() {
        let (_tmp, store) = store();
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(
            store.path(),
            r#"{"schema_version": 1, "state": "open", "timestamp": "2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(store.read().is_err());
    }
}
