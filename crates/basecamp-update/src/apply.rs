//! Apply mode — the successor half of the self-replacement handoff.
//!
//! The installing process stages files, writes `saved_args.json`, spawns
//! `<exe> apply`, and exits. The apply process runs here: it finds the
//! newest stage, copies it over the install root (the predecessor has
//! exited, so even the executable is replaceable), consumes the replay
//! manifest, and re-execs the installed binary with the original arguments
//! in a new session so this process can exit immediately.

use std::path::{Path, PathBuf};
use std::process::Command;

use basecamp_core::manifest::{ManifestError, SavedArgs, SAVED_ARGS_FILE};

use crate::install::{self, InstallError};

/// Modes whose replayed arguments make no sense on relaunch. When the saved
/// argv selected one of these, the successor starts bare (default `run`).
const MODE_TOKENS: &[&str] = &["apply", "build", "release"];

/// Find the newest stage directory under `update_root` that contains a
/// replay manifest.
pub fn find_latest_stage(update_root: &Path) -> Result<Option<PathBuf>, ApplyError> {
    let entries = match std::fs::read_dir(update_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ApplyError::io(update_root, e)),
    };

    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in entries {
        let entry = entry.map_err(|e| ApplyError::io(update_root, e))?;
        let path = entry.path();
        if !path.is_dir() || !path.join(SAVED_ARGS_FILE).is_file() {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .map_err(|e| ApplyError::io(&path, e))?;
        if newest.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}

/// Copy a stage over the install root and consume its replay manifest.
///
/// Returns the saved argv. At least one file must be deployed — an empty
/// stage means the handoff went wrong and aborting leaves the predecessor's
/// backup in place.
pub fn apply_stage(stage: &Path, install_root: &Path) -> Result<SavedArgs, ApplyError> {
    let saved = SavedArgs::load(stage)?;

    let mut deployed = 0usize;
    copy_tree(stage, stage, install_root, &mut deployed)?;
    if deployed == 0 {
        return Err(ApplyError::EmptyStage(stage.to_path_buf()));
    }

    // the manifest is consumed exactly once
    let manifest_path = stage.join(SAVED_ARGS_FILE);
    std::fs::remove_file(&manifest_path).map_err(|e| ApplyError::io(&manifest_path, e))?;

    tracing::info!(
        stage = %stage.display(),
        root = %install_root.display(),
        deployed,
        version = %saved.version,
        "stage applied"
    );
    Ok(saved)
}

fn copy_tree(
    stage_root: &Path,
    dir: &Path,
    install_root: &Path,
    deployed: &mut usize,
) -> Result<(), ApplyError> {
    let entries = std::fs::read_dir(dir).map_err(|e| ApplyError::io(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| ApplyError::io(dir, e))?;
        let path = entry.path();
        if path.is_dir() {
            copy_tree(stage_root, &path, install_root, deployed)?;
            continue;
        }
        let rel = path.strip_prefix(stage_root).expect("walked path is under stage");
        if rel == Path::new(SAVED_ARGS_FILE) {
            continue;
        }
        let target = install_root.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ApplyError::io(parent, e))?;
        }
        // fs::copy carries mode bits on unix; the predecessor has exited,
        // so direct overwrite is safe on windows here as well
        std::fs::copy(&path, &target).map_err(|e| ApplyError::io(&path, e))?;
        *deployed += 1;
    }
    Ok(())
}

/// Strip mode-switching tokens from a replayed argv.
///
/// `["agent", "run", "-l", "debug"]` is kept as-is; `["agent", "apply"]`
/// or `["agent", "build", "-v", "1.0.0"]` collapse to `["agent"]`.
pub fn normalize_replay_argv(argv: &[String]) -> Vec<String> {
    match argv.split_first() {
        Some((program, rest)) => {
            if rest.first().map(|t| MODE_TOKENS.contains(&t.as_str())).unwrap_or(false) {
                vec![program.clone()]
            } else {
                argv.to_vec()
            }
        }
        None => Vec::new(),
    }
}

/// Launch the installed executable with the replayed arguments, detached
/// into its own session/process group, and return without waiting.
pub fn spawn_successor(install_root: &Path, saved: &SavedArgs) -> Result<(), ApplyError> {
    let argv = normalize_replay_argv(&saved.argv);
    let exe = successor_executable(install_root, &argv)?;

    let mut command = Command::new(&exe);
    command.args(argv.iter().skip(1));
    command.current_dir(install_root);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    command
        .spawn()
        .map_err(|e| ApplyError::Relaunch(exe.display().to_string(), e))?;
    tracing::info!(exe = %exe.display(), ?argv, "successor launched");
    Ok(())
}

/// The executable to relaunch: the replayed program name resolved inside
/// the install root, falling back to this process's own image.
fn successor_executable(install_root: &Path, argv: &[String]) -> Result<PathBuf, ApplyError> {
    if let Some(program) = argv.first() {
        if let Some(name) = Path::new(program).file_name() {
            let candidate = install_root.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    std::env::current_exe().map_err(ApplyError::NoExecutable)
}

/// Full apply mode: finish any pending `.new` renames, deploy the newest
/// stage, and hand off to the installed binary.
pub fn run(install_root: &Path, update_root: &Path) -> Result<(), ApplyError> {
    if cfg!(windows) {
        install::sweep_pending_renames(install_root)?;
    }

    let stage = find_latest_stage(update_root)?
        .ok_or_else(|| ApplyError::NoStage(update_root.to_path_buf()))?;
    let saved = apply_stage(&stage, install_root)?;
    spawn_successor(install_root, &saved)?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("no stage with a replay manifest under {0}")]
    NoStage(PathBuf),
    #[error("stage deployed zero files: {0}")]
    EmptyStage(PathBuf),
    #[error("failed to relaunch {0}: {1}")]
    Relaunch(String, #[source] std::io::Error),
    #[error("cannot determine an executable to relaunch: {0}")]
    NoExecutable(#[source] std::io::Error),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Install(#[from] InstallError),
    #[error("apply i/o failed at {0}: {1}")]
    Io(String, #[source] std::io::Error),
}

impl ApplyError {
    fn io(path: &Path, e: std::io::Error) -> Self {
        Self::Io(path.display().to_string(), e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::write_replay_manifest;

    fn make_stage(update_root: &Path, version: &str, argv: Vec<String>) -> PathBuf {
        let stage = update_root.join(version);
        std::fs::create_dir_all(&stage).unwrap();
        std::fs::write(stage.join("agent"), format!("binary {version}")).unwrap();
        write_replay_manifest(&stage, argv, version).unwrap();
        stage
    }

    #[test]
    fn finds_newest_stage_with_manifest() {
        let update_root = tempfile::tempdir().unwrap();
        let old = make_stage(update_root.path(), "1.0.0", vec!["agent".into()]);
        // a stage without a manifest is not a candidate
        std::fs::create_dir(update_root.path().join("1.0.5")).unwrap();
        // make the newer stage clearly newer
        let newer = make_stage(update_root.path(), "1.1.0", vec!["agent".into()]);
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
        let file = std::fs::File::open(&newer).unwrap();
        file.set_modified(later).unwrap();

        let found = find_latest_stage(update_root.path()).unwrap().unwrap();
        assert_eq!(found, newer);
        assert_ne!(found, old);
    }

    #[test]
    fn missing_update_root_is_just_empty() {
        let dir = tempfile::tempdir().unwrap();
        let found = find_latest_stage(&dir.path().join("nope")).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn apply_copies_files_and_consumes_manifest() {
        let update_root = tempfile::tempdir().unwrap();
        let install_root = tempfile::tempdir().unwrap();
        let stage = make_stage(
            update_root.path(),
            "2.0.0",
            vec!["agent".into(), "run".into()],
        );
        std::fs::create_dir(stage.join("lib")).unwrap();
        std::fs::write(stage.join("lib/module"), b"lib v2").unwrap();

        let saved = apply_stage(&stage, install_root.path()).unwrap();

        assert_eq!(saved.version, "2.0.0");
        assert_eq!(
            std::fs::read(install_root.path().join("agent")).unwrap(),
            b"binary 2.0.0"
        );
        assert_eq!(
            std::fs::read(install_root.path().join("lib/module")).unwrap(),
            b"lib v2"
        );
        // consumed exactly once: gone from the stage, not deployed either
        assert!(!stage.join(SAVED_ARGS_FILE).exists());
        assert!(!install_root.path().join(SAVED_ARGS_FILE).exists());
    }

    #[test]
    fn apply_rejects_empty_stage() {
        let update_root = tempfile::tempdir().unwrap();
        let install_root = tempfile::tempdir().unwrap();
        let stage = update_root.path().join("3.0.0");
        std::fs::create_dir_all(&stage).unwrap();
        write_replay_manifest(&stage, vec!["agent".into()], "3.0.0").unwrap();

        assert!(matches!(
            apply_stage(&stage, install_root.path()),
            Err(ApplyError::EmptyStage(_))
        ));
    }

    #[test]
    fn normalize_drops_mode_tokens() {
        let argv = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert_eq!(
            normalize_replay_argv(&argv(&["agent", "run", "-l", "debug"])),
            argv(&["agent", "run", "-l", "debug"])
        );
        assert_eq!(normalize_replay_argv(&argv(&["agent", "apply"])), argv(&["agent"]));
        assert_eq!(
            normalize_replay_argv(&argv(&["agent", "build", "-v", "1.0.0"])),
            argv(&["agent"])
        );
        assert_eq!(
            normalize_replay_argv(&argv(&["agent", "release", "-v", "1.0.0", "-a"])),
            argv(&["agent"])
        );
        assert_eq!(normalize_replay_argv(&argv(&["agent"])), argv(&["agent"]));
        assert!(normalize_replay_argv(&[]).is_empty());
    }
}
