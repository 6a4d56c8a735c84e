//! Staged install: backup, deploy, replay manifest.
//!
//! The installer never touches the running process. It copies the verified
//! stage into the install root (directly on POSIX, as `.new` files on
//! Windows, where the in-use executable cannot be replaced), takes a
//! timestamped backup first, and leaves a replay manifest behind for the
//! apply-mode successor. Restoring from a backup is an operator decision —
//! nothing here ever reads one back.

use std::path::{Path, PathBuf};

use basecamp_core::manifest::{SavedArgs, SAVED_ARGS_FILE};

/// Prefix of backup directories inside the install root.
pub const BACKUP_PREFIX: &str = "backup_";

/// What an install did, for the caller and for operator tooling layered on
/// top (the backup path is deliberately surfaced, see module docs).
#[derive(Debug)]
pub struct InstallReport {
    pub version: String,
    pub backup_dir: Option<PathBuf>,
    pub deployed: usize,
}

/// Copy every regular file directly under `root` (skipping previous
/// backups) into a fresh `backup_<timestamp>/`. Returns the backup path,
/// or `None` when there was nothing to back up.
pub fn create_backup(root: &Path) -> Result<Option<PathBuf>, InstallError> {
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let backup_dir = root.join(format!("{BACKUP_PREFIX}{timestamp}"));

    let entries = std::fs::read_dir(root).map_err(|e| InstallError::io(root, e))?;
    let mut copied = 0usize;
    for entry in entries {
        let entry = entry.map_err(|e| InstallError::io(root, e))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if !path.is_file() || name.starts_with(BACKUP_PREFIX) {
            continue;
        }
        if copied == 0 {
            std::fs::create_dir_all(&backup_dir).map_err(|e| InstallError::io(&backup_dir, e))?;
        }
        std::fs::copy(&path, backup_dir.join(&name)).map_err(|e| InstallError::io(&path, e))?;
        copied += 1;
        tracing::debug!(file = %name, "backed up");
    }

    if copied == 0 {
        return Ok(None);
    }
    tracing::info!(backup = %backup_dir.display(), files = copied, "backup created");
    Ok(Some(backup_dir))
}

/// Deploy a verified stage into the install root.
///
/// The replay manifest is not part of the payload and is skipped. On POSIX
/// targets files are copied over their targets, mode bits included; on
/// Windows each file lands as `<target>.new` and the swap happens on the
/// next start (apply mode or the startup rename sweep).
pub fn deploy_stage(stage: &Path, root: &Path) -> Result<usize, InstallError> {
    if !stage.is_dir() {
        return Err(InstallError::NoStage(stage.to_path_buf()));
    }
    let mut deployed = 0usize;
    deploy_tree(stage, stage, root, &mut deployed)?;
    tracing::info!(stage = %stage.display(), root = %root.display(), deployed, "stage deployed");
    Ok(deployed)
}

fn deploy_tree(
    stage_root: &Path,
    dir: &Path,
    install_root: &Path,
    deployed: &mut usize,
) -> Result<(), InstallError> {
    let entries = std::fs::read_dir(dir).map_err(|e| InstallError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| InstallError::io(dir, e))?;
        let path = entry.path();
        if path.is_dir() {
            deploy_tree(stage_root, &path, install_root, deployed)?;
            continue;
        }
        let rel = path.strip_prefix(stage_root).expect("walked path is under stage");
        if rel == Path::new(SAVED_ARGS_FILE) {
            continue;
        }

        let target = install_root.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| InstallError::io(parent, e))?;
        }

        if cfg!(windows) {
            let staged = target.with_extension(new_extension(&target));
            std::fs::copy(&path, &staged).map_err(|e| InstallError::io(&path, e))?;
        } else {
            // fs::copy carries permission bits, so the exec bit survives
            std::fs::copy(&path, &target).map_err(|e| InstallError::io(&path, e))?;
        }
        tracing::debug!(file = %rel.display(), "deployed");
        *deployed += 1;
    }
    Ok(())
}

/// `agent.exe` → `agent.exe.new` (appends rather than replaces the
/// extension).
fn new_extension(target: &Path) -> String {
    match target.extension() {
        Some(ext) => format!("{}.new", ext.to_string_lossy()),
        None => "new".to_string(),
    }
}

/// Write (or refresh) the replay manifest in a stage directory.
pub fn write_replay_manifest(
    stage: &Path,
    argv: Vec<String>,
    version: &str,
) -> Result<(), InstallError> {
    SavedArgs::new(argv, version)
        .store(stage)
        .map_err(InstallError::Manifest)
}

/// Rename every `<name>.new` directly under `root` over `<name>`, keeping
/// the displaced file as `<name>.old`. Returns how many files were swapped.
///
/// This finishes a Windows-staged install; it is harmless (and a no-op)
/// when nothing was staged.
pub fn sweep_pending_renames(root: &Path) -> Result<usize, InstallError> {
    let entries = std::fs::read_dir(root).map_err(|e| InstallError::io(root, e))?;
    let mut swapped = 0usize;
    for entry in entries {
        let entry = entry.map_err(|e| InstallError::io(root, e))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(stem) = name.strip_suffix(".new") else {
            continue;
        };
        if !path.is_file() {
            continue;
        }

        let target = root.join(stem);
        if target.exists() {
            let displaced = root.join(format!("{stem}.old"));
            if displaced.exists() {
                std::fs::remove_file(&displaced).map_err(|e| InstallError::io(&displaced, e))?;
            }
            std::fs::rename(&target, &displaced).map_err(|e| InstallError::io(&target, e))?;
        }
        std::fs::rename(&path, &target).map_err(|e| InstallError::io(&path, e))?;
        tracing::info!(file = %target.display(), "applied pending update");
        swapped += 1;
    }
    Ok(swapped)
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("stage directory does not exist: {0}")]
    NoStage(PathBuf),
    #[error("install i/o failed at {0}: {1}")]
    Io(String, #[source] std::io::Error),
    #[error(transparent)]
    Manifest(#[from] basecamp_core::manifest::ManifestError),
}

impl InstallError {
    fn io(path: &Path, e: std::io::Error) -> Self {
        Self::Io(path.display().to_string(), e)
    }
}
