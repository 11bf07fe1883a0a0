//! Secure module loader: allow-list by content digest, fail closed.
//!
//! Policy modules live under a single root directory. A module is only handed
//! out after (1) its path is shown to stay inside the root, lexically and
//! after link resolution, and (2) the SHA-256 of the bytes read *now* matches
//! the manifest. The same buffer that was hashed is the one callers parse, so
//! nothing can change between verification and use.

pub mod manifest;
pub mod policy;

pub use manifest::{ManifestEntry, ModuleManifest};
pub use policy::{PolicyMetric, PolicyModule, PolicyRule};

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{error, info};

use crate::errors::GuardError;
use manifest::has_traversal;

/// Opaque handle to module bytes that passed path and digest verification.
///
/// Only [`ModuleLoader::load`] constructs one.
#[derive(Clone)]
pub struct VerifiedModule {
    name: String,
    digest: String,
    bytes: Arc<[u8]>,
}

impl VerifiedModule {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[cfg(test)]
    pub(crate) fn for_tests(name: &str, bytes: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            digest: sha256_hex(bytes),
            bytes: Arc::from(bytes),
        }
    }
}

impl fmt::Debug for VerifiedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerifiedModule")
            .field("name", &self.name)
            .field("digest", &self.digest)
            .field("len", &self.bytes.len())
            .finish()
    }
}

pub struct ModuleLoader {
    /// Canonical root; every module must resolve beneath it.
    root: PathBuf,
    entries: BTreeMap<String, ManifestEntry>,
    digests_computed: AtomicU64,
}

impl ModuleLoader {
    /// Create a loader for `root`. The root itself must exist.
    pub fn new(root: &Path) -> Result<Self, GuardError> {
        let root = std::fs::canonicalize(root).map_err(|e| GuardError::Manifest {
            reason: format!("module root {} cannot be resolved: {e}", root.display()),
        })?;
        if !root.is_dir() {
            return Err(GuardError::Manifest {
                reason: format!("module root {} is not a directory", root.display()),
            });
        }
        Ok(Self {
            root,
            entries: BTreeMap::new(),
            digests_computed: AtomicU64::new(0),
        })
    }

    /// Build a loader with every manifest entry registered.
    pub fn from_manifest(manifest: &ModuleManifest) -> Result<Self, GuardError> {
        let mut loader = Self::new(&manifest.root)?;
        for entry in &manifest.entries {
            loader.register(entry.clone())?;
        }
        Ok(loader)
    }

    /// Allow-list a module. Nothing is read from disk here; the digest is
    /// only compared when the module is loaded.
    pub fn register(&mut self, entry: ManifestEntry) -> Result<(), GuardError> {
        let problems = entry.check();
        if !problems.is_empty() {
            return Err(GuardError::Manifest {
                reason: problems.join("; "),
            });
        }
        if self.entries.contains_key(&entry.name) {
            return Err(GuardError::Manifest {
                reason: format!("module '{}' registered twice", entry.name),
            });
        }
        self.entries.insert(entry.name.clone(), entry);
        Ok(())
    }

    /// Resolve, confine, hash and hand out a module.
    pub fn load(&self, name: &str) -> Result<VerifiedModule, GuardError> {
        let result = self.load_inner(name);
        if let Err(e) = &result {
            error!(module = name, error = %e, "module load rejected");
        }
        result
    }

    fn load_inner(&self, name: &str) -> Result<VerifiedModule, GuardError> {
        let entry = self.entries.get(name).ok_or_else(|| GuardError::Integrity {
            module: name.to_string(),
            reason: "no manifest entry".into(),
        })?;

        // 1. Lexical confinement, before touching the filesystem.
        if has_traversal(&entry.path) {
            return Err(GuardError::PathViolation {
                module: name.to_string(),
                reason: format!("path {} contains a traversal sequence", entry.path.display()),
            });
        }

        // 2. Link confinement: the resolved path must still be under root.
        let candidate = self.root.join(&entry.path);
        let resolved = match std::fs::canonicalize(&candidate) {
            Ok(resolved) => resolved,
            Err(e) => {
                // A dangling link is still judged by where it points.
                if let Some(target) = link_target(&candidate) {
                    if !target.starts_with(&self.root) {
                        return Err(GuardError::PathViolation {
                            module: name.to_string(),
                            reason: format!(
                                "{} links to {} outside root {}",
                                candidate.display(),
                                target.display(),
                                self.root.display()
                            ),
                        });
                    }
                }
                return Err(GuardError::Integrity {
                    module: name.to_string(),
                    reason: format!("cannot resolve {}: {e}", candidate.display()),
                });
            }
        };
        if !resolved.starts_with(&self.root) {
            return Err(GuardError::PathViolation {
                module: name.to_string(),
                reason: format!(
                    "{} resolves outside root {}",
                    candidate.display(),
                    self.root.display()
                ),
            });
        }
        if !resolved.is_file() {
            return Err(GuardError::Integrity {
                module: name.to_string(),
                reason: format!("{} is not a regular file", resolved.display()),
            });
        }

        // 3. Hash the bytes we will hand out.
        let bytes = std::fs::read(&resolved).map_err(|e| GuardError::Integrity {
            module: name.to_string(),
            reason: format!("cannot read {}: {e}", resolved.display()),
        })?;
        let actual = sha256_hex(&bytes);
        self.digests_computed.fetch_add(1, Ordering::Relaxed);

        if actual != entry.sha256 {
            return Err(GuardError::Integrity {
                module: name.to_string(),
                reason: format!("digest mismatch: expected {}, got {actual}", entry.sha256),
            });
        }

        info!(module = name, digest = %actual, bytes = bytes.len(), "module verified");
        Ok(VerifiedModule {
            name: name.to_string(),
            digest: actual,
            bytes: Arc::from(bytes),
        })
    }

    /// Load every registered module in name order. The first failure aborts.
    pub fn load_all(&self) -> Result<Vec<VerifiedModule>, GuardError> {
        self.entries.keys().map(|name| self.load(name)).collect()
    }

    /// Load and parse every registered module as a policy.
    pub fn load_policies(&self) -> Result<Vec<PolicyModule>, GuardError> {
        self.load_all()?
            .iter()
            .map(PolicyModule::from_verified)
            .collect()
    }

    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of digests computed so far.
    pub fn digests_computed(&self) -> u64 {
        self.digests_computed.load(Ordering::Relaxed)
    }
}

/// Lexically resolved target of `path` if it is a symlink.
fn link_target(path: &Path) -> Option<PathBuf> {
    let meta = std::fs::symlink_metadata(path).ok()?;
    if !meta.file_type().is_symlink() {
        return None;
    }
    let target = std::fs::read_link(path).ok()?;
    let joined = match path.parent() {
        Some(parent) if target.is_relative() => parent.join(target),
        _ => target,
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    Some(normalized)
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
