//! Release metadata documents.
//!
//! Two JSON documents live on disk:
//!
//! - `status.json` inside every catalog version directory — the
//!   [`VersionManifest`] describing a built release and its lifecycle state.
//! - `saved_args.json` inside a download stage — the [`SavedArgs`] replay
//!   manifest consumed once by the successor process in apply mode.
//!
//! Both are rewritten whole on every change; there are no partial updates.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Name of the manifest file inside each catalog version directory.
pub const STATUS_FILE: &str = "status.json";

/// Name of the replay manifest inside a download stage.
pub const SAVED_ARGS_FILE: &str = "saved_args.json";

/// Lifecycle state of a built release.
///
/// Transitions are forward-only: a build starts as `Draft`, release approval
/// moves it to `Approved`, and a rollback marks it `Deprecated`. Only
/// approved versions are ever advertised to update clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseStatus {
    Draft,
    Approved,
    Deprecated,
}

/// One file in a release bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative, slash-separated path inside the bundle.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// `"algo:hexdigest"`, see [`crate::checksum`].
    pub checksum: String,
}

/// The `status.json` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionManifest {
    pub version: String,
    pub status: ReleaseStatus,
    /// ISO-8601 UTC build timestamp.
    pub build_time: String,
    /// OS tag of the build host (`linux`, `windows`, `macos`, …).
    pub platform: String,
    pub files: Vec<FileEntry>,
    pub exclude_patterns: Vec<String>,
    pub rollback_target: Option<String>,
    #[serde(default)]
    pub release_notes: String,
}

impl VersionManifest {
    /// A fresh draft manifest stamped with the current time and platform.
    pub fn draft(version: &str, files: Vec<FileEntry>, exclude_patterns: Vec<String>) -> Self {
        Self {
            version: version.to_string(),
            status: ReleaseStatus::Draft,
            build_time: chrono::Utc::now().to_rfc3339(),
            platform: std::env::consts::OS.to_string(),
            files,
            exclude_patterns,
            rollback_target: None,
            release_notes: String::new(),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// Read a manifest from a version directory.
    pub fn load(version_dir: &Path) -> Result<Self, ManifestError> {
        let path = version_dir.join(STATUS_FILE);
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ManifestError::Read(path.display().to_string(), e))?;
        serde_json::from_str(&text).map_err(|e| ManifestError::Parse(path.display().to_string(), e))
    }

    /// Rewrite the manifest in its version directory.
    pub fn store(&self, version_dir: &Path) -> Result<(), ManifestError> {
        let path = version_dir.join(STATUS_FILE);
        let text = serde_json::to_string_pretty(self).expect("manifest always serializes");
        std::fs::write(&path, text).map_err(|e| ManifestError::Write(path.display().to_string(), e))
    }
}

/// The `saved_args.json` replay manifest.
///
/// Records the argv of the process that staged an update so the successor
/// can relaunch with the same invocation after swapping executables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedArgs {
    /// Original launch argv, verbatim, including the program name.
    pub argv: Vec<String>,
    /// Version the stage was downloaded for.
    pub version: String,
    /// ISO-8601 timestamp of when the stage completed.
    pub timestamp: String,
}

impl SavedArgs {
    pub fn new(argv: Vec<String>, version: &str) -> Self {
        Self {
            argv,
            version: version.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn load(stage_dir: &Path) -> Result<Self, ManifestError> {
        let path = stage_dir.join(SAVED_ARGS_FILE);
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ManifestError::Read(path.display().to_string(), e))?;
        serde_json::from_str(&text).map_err(|e| ManifestError::Parse(path.display().to_string(), e))
    }

    pub fn store(&self, stage_dir: &Path) -> Result<(), ManifestError> {
        let path = stage_dir.join(SAVED_ARGS_FILE);
        let text = serde_json::to_string_pretty(self).expect("saved args always serialize");
        std::fs::write(&path, text).map_err(|e| ManifestError::Write(path.display().to_string(), e))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read {0}: {1}")]
    Read(String, #[source] std::io::Error),
    #[error("failed to parse {0}: {1}")]
    Parse(String, #[source] serde_json::Error),
    #[error("failed to write {0}: {1}")]
    Write(String, #[source] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ReleaseStatus::Draft).unwrap(), "\"draft\"");
        assert_eq!(
            serde_json::to_string(&ReleaseStatus::Approved).unwrap(),
            "\"approved\""
        );
        assert_eq!(
            serde_json::from_str::<ReleaseStatus>("\"deprecated\"").unwrap(),
            ReleaseStatus::Deprecated
        );
    }

    #[test]
    fn manifest_store_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = VersionManifest::draft(
            "1.2.0",
            vec![FileEntry {
                path: "bin/agent".into(),
                size: 42,
                checksum: "sha256:deadbeef".into(),
            }],
            vec!["*.log".into()],
        );
        manifest.release_notes = "first cut".into();
        manifest.store(dir.path()).unwrap();

        let loaded = VersionManifest::load(dir.path()).unwrap();
        assert_eq!(loaded.version, "1.2.0");
        assert_eq!(loaded.status, ReleaseStatus::Draft);
        assert_eq!(loaded.files.len(), 1);
        assert_eq!(loaded.total_size(), 42);
        assert_eq!(loaded.release_notes, "first cut");
        assert_eq!(loaded.rollback_target, None);
    }

    #[test]
    fn manifest_load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            VersionManifest::load(dir.path()),
            Err(ManifestError::Read(..))
        ));
    }

    #[test]
    fn saved_args_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let args = SavedArgs::new(vec!["agent".into(), "run".into(), "-l".into(), "debug".into()], "2.0.0");
        args.store(dir.path()).unwrap();

        let loaded = SavedArgs::load(dir.path()).unwrap();
        assert_eq!(loaded.argv, vec!["agent", "run", "-l", "debug"]);
        assert_eq!(loaded.version, "2.0.0");
        assert!(!loaded.timestamp.is_empty());
    }
}
