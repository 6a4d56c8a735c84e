//! Release bundle builder.
//!
//! The build pipeline packages an already-built artifact tree (the output
//! of whatever bundler produced the executable — default `dist/` under the
//! install root) into a draft catalog entry:
//!
//! 1. validate the version
//! 2. copy artifacts, applying exclude patterns
//! 3. compute per-file SHA-256 checksums
//! 4. write `status.json` with `status = draft`
//!
//! Rebuilding an existing version replaces its directory. Approval is a
//! separate step ([`basecamp_update::ReleaseStore::approve`]).

use std::path::{Path, PathBuf};

use basecamp_core::checksum;
use basecamp_core::manifest::{FileEntry, VersionManifest};
use basecamp_core::version;

/// Files never shipped in a bundle: local config and logs.
pub const DEFAULT_EXCLUDE: &[&str] = &["basecamp.toml", "*.log"];

pub struct Builder {
    service_name: String,
    root_path: PathBuf,
    release_path: PathBuf,
}

impl Builder {
    /// `release_path` defaults to `releases/` under the root.
    pub fn new(service_name: &str, root_path: &Path, release_path: Option<PathBuf>) -> Self {
        Self {
            service_name: service_name.to_string(),
            root_path: root_path.to_path_buf(),
            release_path: release_path.unwrap_or_else(|| root_path.join("releases")),
        }
    }

    pub fn release_path(&self) -> &Path {
        &self.release_path
    }

    /// Package `dist_path` (default `dist/` under the root; a single file
    /// is also accepted) as a draft release. Returns the version directory.
    pub fn build(
        &self,
        version: &str,
        dist_path: Option<&Path>,
        exclude_patterns: Option<&[String]>,
    ) -> Result<PathBuf, BuildError> {
        if !version::is_valid(version) {
            return Err(BuildError::InvalidVersion(version.to_string()));
        }

        let default_dist = self.root_path.join("dist");
        let dist = dist_path.unwrap_or(&default_dist);
        if !dist.exists() {
            return Err(BuildError::NoArtifacts(dist.to_path_buf()));
        }

        let patterns: Vec<String> = match exclude_patterns {
            Some(p) => p.to_vec(),
            None => DEFAULT_EXCLUDE.iter().map(|s| s.to_string()).collect(),
        };
        let compiled = compile_patterns(&patterns)?;

        tracing::info!(
            service = %self.service_name,
            version,
            dist = %dist.display(),
            "building release"
        );

        let version_dir = self.prepare_version_dir(version)?;
        match self.populate(version, dist, &version_dir, &patterns, &compiled) {
            Ok(()) => Ok(version_dir),
            Err(e) => {
                // leave no half-built catalog entry behind
                let _ = std::fs::remove_dir_all(&version_dir);
                Err(e)
            }
        }
    }

    fn populate(
        &self,
        version: &str,
        dist: &Path,
        version_dir: &Path,
        patterns: &[String],
        compiled: &[glob::Pattern],
    ) -> Result<(), BuildError> {
        let copied = copy_artifacts(dist, version_dir, compiled)?;
        if copied == 0 {
            return Err(BuildError::NoArtifacts(dist.to_path_buf()));
        }

        let checksums = checksum::directory_checksums(version_dir, compiled)?;
        let files: Vec<FileEntry> = checksums
            .into_iter()
            .map(|(rel, checksum)| {
                let size = std::fs::metadata(version_dir.join(&rel))
                    .map_err(|e| BuildError::Io(rel.clone(), e))?
                    .len();
                Ok(FileEntry {
                    path: rel,
                    size,
                    checksum,
                })
            })
            .collect::<Result<_, BuildError>>()?;

        let manifest = VersionManifest::draft(version, files, patterns.to_vec());
        manifest.store(version_dir)?;

        tracing::info!(
            version,
            files = manifest.files.len(),
            total_size = manifest.total_size(),
            dir = %version_dir.display(),
            "build complete (draft)"
        );
        Ok(())
    }

    /// Version directory, emptied if it already exists.
    fn prepare_version_dir(&self, version: &str) -> Result<PathBuf, BuildError> {
        let version_dir = self.release_path.join(version);
        if version_dir.exists() {
            tracing::warn!(version, "version already built, replacing");
            std::fs::remove_dir_all(&version_dir)
                .map_err(|e| BuildError::Io(version_dir.display().to_string(), e))?;
        }
        std::fs::create_dir_all(&version_dir)
            .map_err(|e| BuildError::Io(version_dir.display().to_string(), e))?;
        Ok(version_dir)
    }
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<glob::Pattern>, BuildError> {
    patterns
        .iter()
        .map(|p| glob::Pattern::new(p).map_err(|e| BuildError::BadPattern(p.clone(), e)))
        .collect()
}

/// Copy `source` (file or tree) into `destination`, skipping files whose
/// name matches an exclude pattern. Returns the number of files copied.
fn copy_artifacts(
    source: &Path,
    destination: &Path,
    exclude: &[glob::Pattern],
) -> Result<usize, BuildError> {
    if source.is_file() {
        let name = source.file_name().unwrap_or_default().to_string_lossy();
        if exclude.iter().any(|p| p.matches(&name)) {
            return Ok(0);
        }
        std::fs::copy(source, destination.join(name.as_ref()))
            .map_err(|e| BuildError::Io(source.display().to_string(), e))?;
        return Ok(1);
    }

    let mut copied = 0usize;
    copy_tree(source, source, destination, exclude, &mut copied)?;
    Ok(copied)
}

fn copy_tree(
    source_root: &Path,
    dir: &Path,
    destination: &Path,
    exclude: &[glob::Pattern],
    copied: &mut usize,
) -> Result<(), BuildError> {
    let entries =
        std::fs::read_dir(dir).map_err(|e| BuildError::Io(dir.display().to_string(), e))?;
    for entry in entries {
        let entry = entry.map_err(|e| BuildError::Io(dir.display().to_string(), e))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if exclude.iter().any(|p| p.matches(&name)) {
            continue;
        }
        if path.is_dir() {
            copy_tree(source_root, &path, destination, exclude, copied)?;
            continue;
        }
        let rel = path.strip_prefix(source_root).expect("walked path is under source");
        let target = destination.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BuildError::Io(parent.display().to_string(), e))?;
        }
        std::fs::copy(&path, &target).map_err(|e| BuildError::Io(path.display().to_string(), e))?;
        *copied += 1;
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("invalid version format: {0:?}")]
    InvalidVersion(String),
    #[error("no build artifacts at {0}")]
    NoArtifacts(PathBuf),
    #[error("bad exclude pattern {0:?}: {1}")]
    BadPattern(String, #[source] glob::PatternError),
    #[error("build i/o failed at {0}: {1}")]
    Io(String, #[source] std::io::Error),
    #[error(transparent)]
    Checksum(#[from] basecamp_core::checksum::ChecksumError),
    #[error(transparent)]
    Manifest(#[from] basecamp_core::manifest::ManifestError),
}
