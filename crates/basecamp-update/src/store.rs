//! Filesystem-backed release catalog.
//!
//! The catalog root's immediate children are version directories, each
//! holding a `status.json` manifest plus the bundle files it describes:
//!
//! ```text
//! releases/
//!   1.0.0/
//!     status.json
//!     agent
//!     lib/module.rs
//!   1.1.0/
//!     ...
//! ```
//!
//! Only `approved` versions are ever advertised. There is no database and no
//! in-memory cache of record: the directory is re-scanned on every
//! `__request_versions__` so promotions become visible without a restart.

use std::path::{Path, PathBuf};

use basecamp_core::manifest::{ManifestError, ReleaseStatus, VersionManifest, STATUS_FILE};
use basecamp_core::version::Version;

#[derive(Debug, Clone)]
pub struct ReleaseStore {
    root: PathBuf,
}

impl ReleaseStore {
    /// Open a catalog root. The directory must exist.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ReleaseError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(ReleaseError::NoCatalog(root));
        }
        Ok(Self { root })
    }

    /// Open a catalog root, creating the directory if needed.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, ReleaseError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| ReleaseError::Io(root.display().to_string(), e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one version. The version string must parse, which also
    /// keeps path separators and `..` out of catalog lookups driven by the
    /// wire.
    pub fn version_dir(&self, version: &str) -> Result<PathBuf, ReleaseError> {
        version
            .parse::<Version>()
            .map_err(|_| ReleaseError::InvalidVersion(version.to_string()))?;
        Ok(self.root.join(version))
    }

    /// Scan the catalog and return the approved versions, sorted ascending
    /// by parsed version. Entries without a readable manifest, with a
    /// non-version directory name, or in another status are skipped (the
    /// skip is logged, not an error).
    pub fn scan(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(root = %self.root.display(), error = %e, "catalog scan failed");
                return Vec::new();
            }
        };

        let mut approved: Vec<(Version, String)> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let parsed: Version = match name.parse() {
                Ok(v) => v,
                Err(_) => {
                    tracing::warn!(dir = %name, "skipping non-version catalog entry");
                    continue;
                }
            };
            if !path.join(STATUS_FILE).exists() {
                tracing::warn!(version = %name, "no status.json, skipping");
                continue;
            }
            match VersionManifest::load(&path) {
                Ok(manifest) if manifest.status == ReleaseStatus::Approved => {
                    approved.push((parsed, name));
                }
                Ok(manifest) => {
                    tracing::debug!(version = %name, status = ?manifest.status, "not approved, skipping");
                }
                Err(e) => {
                    tracing::warn!(version = %name, error = %e, "unreadable manifest, skipping");
                }
            }
        }

        approved.sort_by_key(|(v, _)| *v);
        approved.into_iter().map(|(_, name)| name).collect()
    }

    /// Newest approved version, if any.
    pub fn latest(&self) -> Option<String> {
        self.scan().into_iter().next_back()
    }

    /// Read one version's manifest.
    pub fn manifest(&self, version: &str) -> Result<VersionManifest, ReleaseError> {
        let dir = self.version_dir(version)?;
        if !dir.join(STATUS_FILE).exists() {
            return Err(ReleaseError::NotFound(version.to_string()));
        }
        Ok(VersionManifest::load(&dir)?)
    }

    /// Approve a built version, optionally attaching release notes and a
    /// rollback target.
    ///
    /// Idempotent: approving an approved version rewrites the manifest with
    /// the latest notes. Approving a deprecated version is refused —
    /// transitions are forward-only.
    pub fn approve(
        &self,
        version: &str,
        release_notes: Option<&str>,
        rollback_target: Option<&str>,
    ) -> Result<VersionManifest, ReleaseError> {
        let dir = self.version_dir(version)?;
        let mut manifest = self.manifest(version)?;

        if manifest.status == ReleaseStatus::Deprecated {
            return Err(ReleaseError::IllegalTransition {
                version: version.to_string(),
                from: ReleaseStatus::Deprecated,
                to: ReleaseStatus::Approved,
            });
        }

        manifest.status = ReleaseStatus::Approved;
        if let Some(notes) = release_notes {
            manifest.release_notes = notes.to_string();
        }
        if let Some(target) = rollback_target {
            manifest.rollback_target = Some(target.to_string());
        }
        manifest.store(&dir)?;
        tracing::info!(version, "release approved");
        Ok(manifest)
    }

    /// Mark `from` deprecated with `to` as its rollback target.
    ///
    /// `to` must exist; a non-approved target is allowed but logged, since
    /// clients will not see it until it is approved.
    pub fn rollback(&self, from: &str, to: &str) -> Result<VersionManifest, ReleaseError> {
        let to_manifest = self.manifest(to)?;
        if to_manifest.status != ReleaseStatus::Approved {
            tracing::warn!(
                version = to,
                status = ?to_manifest.status,
                "rollback target is not approved"
            );
        }

        let from_dir = self.version_dir(from)?;
        let mut from_manifest = self.manifest(from)?;
        from_manifest.status = ReleaseStatus::Deprecated;
        from_manifest.rollback_target = Some(to.to_string());
        from_manifest.store(&from_dir)?;

        tracing::info!(from, to, "release rolled back");
        Ok(from_manifest)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("release catalog does not exist: {0}")]
    NoCatalog(PathBuf),
    #[error("invalid version string: {0:?}")]
    InvalidVersion(String),
    #[error("version not found in catalog: {0}")]
    NotFound(String),
    #[error("cannot move {version} from {from:?} to {to:?}: transitions are forward-only")]
    IllegalTransition {
        version: String,
        from: ReleaseStatus,
        to: ReleaseStatus,
    },
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("catalog i/o failed at {0}: {1}")]
    Io(String, #[source] std::io::Error),
}
