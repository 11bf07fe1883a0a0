use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::constants::SHA256_HEX_LEN;
use crate::errors::GuardError;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    root: PathBuf,
    modules: BTreeMap<String, RawEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEntry {
    path: PathBuf,
    sha256: String,
}

/// One allow-listed module: name, root-relative path, expected digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub name: String,
    pub path: PathBuf,
    /// Lowercase hex SHA-256.
    pub sha256: String,
}

impl ManifestEntry {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, sha256: &str) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            sha256: sha256.to_ascii_lowercase(),
        }
    }

    /// Shape checks that need no filesystem access.
    pub(crate) fn check(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push("module name must not be empty".into());
        }
        if self.path.as_os_str().is_empty() {
            errors.push(format!("{}: path must not be empty", self.name));
        }
        if self.sha256.len() != SHA256_HEX_LEN
            || !self.sha256.chars().all(|c| c.is_ascii_hexdigit())
        {
            errors.push(format!(
                "{}: sha256 must be {SHA256_HEX_LEN} hex characters",
                self.name
            ));
        }
        errors
    }
}

/// Allow-list of policy modules, loaded once at startup.
#[derive(Debug, Clone)]
pub struct ModuleManifest {
    pub root: PathBuf,
    pub entries: Vec<ManifestEntry>,
}

impl ModuleManifest {
    /// Load a manifest file. A relative `root` is resolved against the
    /// manifest's own directory.
    pub fn from_file(path: &Path) -> Result<Self, GuardError> {
        let contents = std::fs::read_to_string(path).map_err(|e| GuardError::Manifest {
            reason: format!("cannot read {}: {e}", path.display()),
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&contents, base)
    }

    /// Parse manifest JSON. Every malformed entry is reported, not just the first.
    pub fn parse(json: &str, base_dir: &Path) -> Result<Self, GuardError> {
        let raw: RawManifest = serde_json::from_str(json).map_err(|e| GuardError::Manifest {
            reason: format!("invalid manifest JSON: {e}"),
        })?;

        let mut errors = Vec::new();
        if raw.root.as_os_str().is_empty() {
            errors.push("root must not be empty".to_string());
        }
        if raw.modules.is_empty() {
            errors.push("modules must not be empty".to_string());
        }

        let entries: Vec<ManifestEntry> = raw
            .modules
            .into_iter()
            .map(|(name, entry)| ManifestEntry::new(name, entry.path, &entry.sha256))
            .collect();
        for entry in &entries {
            errors.extend(entry.check());
            if entry.path.is_absolute() {
                errors.push(format!("{}: path must be relative to root", entry.name));
            }
        }

        if !errors.is_empty() {
            return Err(GuardError::Manifest {
                reason: errors.join("; "),
            });
        }

        let root = if raw.root.is_absolute() {
            raw.root
        } else {
            base_dir.join(raw.root)
        };
        Ok(Self { root, entries })
    }
}

/// True if the path contains anything other than plain names and `.`.
pub(crate) fn has_traversal(path: &Path) -> bool {
    path.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}
