//! Updater — the client side of the update protocol.
//!
//! The command stream is asynchronous; the updater gives the service author
//! blocking-feeling methods over it. Each request/response pair is bridged
//! by a single-shot event plus a response slot: the reply handler fills the
//! slot and sets the event, the public method clears, sends, and waits with
//! a timeout. The protocol has no correlation ids, so issuing the same
//! request concurrently on one dispatcher is not supported.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use basecamp_core::checksum;
use basecamp_core::config::{BasecampConfig, ConfigError};
use basecamp_core::manifest::FileEntry;
use basecamp_core::version::{Version, VersionError};
use basecamp_core::wire::{self, DownloadComplete, DownloadStart, ForceUpdate, TransferError};
use basecamp_net::{CommandError, Commander, Endpoint, NetError};

use crate::event::Event;
use crate::install::{self, InstallError, InstallReport};

/// Default timeout for metadata requests. Downloads get triple this.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// The runtime surface the updater needs for the self-replacement handoff:
/// somewhere to park the spawn-successor callback until the event loop has
/// fully unwound, and a way to ask the service to stop.
pub trait RestartHandle: Send + Sync {
    /// Register a callback to run after the service's runtime has shut
    /// down, in registration order.
    fn append_closer(&self, closer: Box<dyn FnOnce() + Send>);
    /// Ask the service to stop; the normal lifecycle drains from here.
    fn stop(&self);
}

/// Construction parameters for [`Updater::attach`].
#[derive(Debug, Clone)]
pub struct UpdaterOptions {
    /// Directory the running executable was installed to.
    pub install_root: PathBuf,
    /// Stage root; downloads land in `<update_path>/<version>/`.
    pub update_path: PathBuf,
    /// Config file rewritten with the new version after an install.
    pub config_path: PathBuf,
    /// Version this process is running.
    pub current_version: String,
    /// Launch argv to record in the replay manifest.
    pub argv: Vec<String>,
    /// Metadata request timeout.
    pub timeout: Duration,
}

impl UpdaterOptions {
    pub fn new(install_root: impl Into<PathBuf>, current_version: &str) -> Self {
        let install_root = install_root.into();
        Self {
            update_path: install_root.join("updates"),
            config_path: BasecampConfig::file_path(&install_root),
            install_root,
            current_version: current_version.to_string(),
            argv: std::env::args().collect(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Clone)]
pub struct Updater {
    inner: Arc<Inner>,
}

struct Inner {
    cmdr: Commander,
    restart: Arc<dyn RestartHandle>,
    options: UpdaterOptions,
    current_version: std::sync::Mutex<String>,

    available_versions: std::sync::Mutex<Vec<String>>,
    latest_version: std::sync::Mutex<Option<String>>,
    download_status: std::sync::Mutex<Option<String>>,
    download_error: std::sync::Mutex<Option<String>>,

    versions_received: Event,
    latest_received: Event,
    download_completed: Event,
}

impl Updater {
    /// Register the client-side handlers on `cmdr` and create the stage
    /// root.
    pub fn attach(
        cmdr: &Commander,
        restart: Arc<dyn RestartHandle>,
        options: UpdaterOptions,
    ) -> Result<Self, UpdateError> {
        std::fs::create_dir_all(&options.update_path)
            .map_err(|e| UpdateError::Stage(options.update_path.display().to_string(), e))?;

        let updater = Self {
            inner: Arc::new(Inner {
                cmdr: cmdr.clone(),
                restart,
                current_version: std::sync::Mutex::new(options.current_version.clone()),
                options,
                available_versions: std::sync::Mutex::new(Vec::new()),
                latest_version: std::sync::Mutex::new(None),
                download_status: std::sync::Mutex::new(None),
                download_error: std::sync::Mutex::new(None),
                versions_received: Event::new(),
                latest_received: Event::new(),
                download_completed: Event::new(),
            }),
        };

        {
            let u = updater.clone();
            cmdr.register(wire::RECEIVE_VERSIONS, move |_, body, _| {
                let u = u.clone();
                async move {
                    u.on_receive_versions(body);
                    Ok(())
                }
            })?;
        }
        {
            let u = updater.clone();
            cmdr.register(wire::RECEIVE_LATEST_VERSION, move |_, body, _| {
                let u = u.clone();
                async move {
                    u.on_receive_latest(body);
                    Ok(())
                }
            })?;
        }
        {
            let u = updater.clone();
            cmdr.register(wire::DOWNLOAD_START, move |cmdr, body, serial| {
                let u = u.clone();
                async move { u.on_download_start(cmdr, body, serial).await }
            })?;
        }
        {
            let u = updater.clone();
            cmdr.register(wire::DOWNLOAD_COMPLETE, move |_, body, _| {
                let u = u.clone();
                async move {
                    u.on_download_complete(body);
                    Ok(())
                }
            })?;
        }
        {
            let u = updater.clone();
            cmdr.register(wire::DOWNLOAD_FAILED, move |_, body, _| {
                let u = u.clone();
                async move {
                    u.on_download_failed(body);
                    Ok(())
                }
            })?;
        }
        {
            let u = updater.clone();
            cmdr.register(wire::APPLY_UPDATE, move |cmdr, body, serial| {
                let u = u.clone();
                async move { u.on_apply_update(cmdr, body, serial) }
            })?;
        }

        tracing::info!(
            stage_root = %updater.inner.options.update_path.display(),
            "updater attached"
        );
        Ok(updater)
    }

    pub fn current_version(&self) -> String {
        self.inner.current_version.lock().unwrap().clone()
    }

    /// Versions reported by the last successful [`Updater::fetch_versions`].
    pub fn available_versions(&self) -> Vec<String> {
        self.inner.available_versions.lock().unwrap().clone()
    }

    /// Latest version reported by the last successful
    /// [`Updater::fetch_latest_version`].
    pub fn latest_known(&self) -> Option<String> {
        self.inner.latest_version.lock().unwrap().clone()
    }

    // ── Blocking facade ──────────────────────────────────────────────────────

    /// Ask the releaser on `serial` for its approved version list.
    pub async fn fetch_versions(&self, serial: u64) -> Result<Vec<String>, UpdateError> {
        self.inner.versions_received.clear();
        self.inner.available_versions.lock().unwrap().clear();

        self.inner
            .cmdr
            .send_command(wire::REQUEST_VERSIONS, json!({}), serial)
            .await?;

        self.wait("version list", &self.inner.versions_received, self.inner.options.timeout)
            .await?;
        Ok(self.available_versions())
    }

    /// Ask the releaser on `serial` for its newest approved version.
    pub async fn fetch_latest_version(&self, serial: u64) -> Result<Option<String>, UpdateError> {
        self.inner.latest_received.clear();
        *self.inner.latest_version.lock().unwrap() = None;

        self.inner
            .cmdr
            .send_command(wire::REQUEST_LATEST_VERSION, json!({}), serial)
            .await?;

        self.wait("latest version", &self.inner.latest_received, self.inner.options.timeout)
            .await?;
        Ok(self.latest_known())
    }

    /// Is a newer version than the running one available?
    pub async fn check_update(&self, serial: u64) -> Result<bool, UpdateError> {
        let Some(latest) = self.fetch_latest_version(serial).await? else {
            tracing::warn!("releaser has no approved versions");
            return Ok(false);
        };
        let current = self.current_version();
        tracing::info!(%current, %latest, "version check");
        Ok(latest.parse::<Version>()? > current.parse::<Version>()?)
    }

    /// Download `version` (or the last known latest) into the stage and
    /// wait for completion. Returns the downloaded version.
    pub async fn download_update(
        &self,
        version: Option<&str>,
        serial: u64,
    ) -> Result<String, UpdateError> {
        let version = match version.map(str::to_string).or_else(|| self.latest_known()) {
            Some(v) => v,
            None => return Err(UpdateError::NoVersionSelected),
        };
        tracing::info!(%version, "requesting download");

        self.inner.download_completed.clear();
        *self.inner.download_status.lock().unwrap() = None;
        *self.inner.download_error.lock().unwrap() = None;

        self.inner
            .cmdr
            .send_command(wire::DOWNLOAD_UPDATE, json!({ "version": version }), serial)
            .await?;

        let download_timeout = self.inner.options.timeout * 3;
        self.wait("download", &self.inner.download_completed, download_timeout)
            .await?;

        if let Some(error) = self.inner.download_error.lock().unwrap().clone() {
            return Err(UpdateError::ServerError(error));
        }
        self.inner
            .download_status
            .lock()
            .unwrap()
            .clone()
            .ok_or(UpdateError::NoVersionSelected)
    }

    /// Install a downloaded stage: back up, deploy, refresh the replay
    /// manifest, and persist the new version in the config.
    pub async fn install_update(&self, version: Option<&str>) -> Result<InstallReport, UpdateError> {
        let version = version
            .map(str::to_string)
            .or_else(|| self.inner.download_status.lock().unwrap().clone())
            .or_else(|| self.latest_known())
            .ok_or(UpdateError::NoVersionSelected)?;
        tracing::info!(%version, "installing update");

        let root = &self.inner.options.install_root;
        let stage = self.inner.options.update_path.join(&version);

        let backup_dir = install::create_backup(root)?;
        let deployed = install::deploy_stage(&stage, root)?;
        install::write_replay_manifest(&stage, self.inner.options.argv.clone(), &version)?;

        let mut config = BasecampConfig::load(&self.inner.options.config_path)?;
        config.service.version = version.clone();
        config.store(&self.inner.options.config_path)?;
        *self.inner.current_version.lock().unwrap() = version.clone();

        tracing::info!(%version, deployed, backup = ?backup_dir, "install complete");
        Ok(InstallReport {
            version,
            backup_dir,
            deployed,
        })
    }

    /// Composite check → download → install → restart.
    /// Returns whether an update was performed.
    pub async fn download_and_install(&self, serial: u64, restart: bool) -> Result<bool, UpdateError> {
        if !self.check_update(serial).await? {
            tracing::info!("already on the latest version");
            return Ok(false);
        }
        let version = self.download_update(None, serial).await?;
        self.install_update(Some(&version)).await?;
        if restart {
            self.restart_service()?;
        }
        Ok(true)
    }

    /// Schedule the apply-mode handoff: the spawn-successor closer runs
    /// after the runtime has unwound (so no file handles or ports are still
    /// held), then the service is asked to stop.
    pub fn restart_service(&self) -> Result<(), UpdateError> {
        let exe = std::env::current_exe().map_err(UpdateError::NoExecutable)?;
        let root = self.inner.options.install_root.clone();

        self.inner.restart.append_closer(Box::new(move || {
            let mut command = std::process::Command::new(&exe);
            command.arg("apply");
            command.current_dir(&root);
            #[cfg(unix)]
            {
                use std::os::unix::process::CommandExt;
                command.process_group(0);
            }
            match command.spawn() {
                Ok(child) => {
                    tracing::info!(pid = child.id(), exe = %exe.display(), "apply-mode successor spawned")
                }
                Err(e) => tracing::error!(error = %e, "failed to spawn apply-mode successor"),
            }
        }));

        tracing::info!("restart scheduled, stopping service");
        self.inner.restart.stop();
        Ok(())
    }

    async fn wait(
        &self,
        what: &'static str,
        event: &Event,
        timeout: Duration,
    ) -> Result<(), UpdateError> {
        tokio::time::timeout(timeout, event.wait())
            .await
            .map_err(|_| {
                tracing::error!(what, ?timeout, "no reply within budget");
                UpdateError::Timeout { what, after: timeout }
            })
    }

    // ── Receive handlers ─────────────────────────────────────────────────────

    fn on_receive_versions(&self, body: serde_json::Value) {
        let versions: Vec<String> = serde_json::from_value(body).unwrap_or_default();
        tracing::info!(count = versions.len(), ?versions, "received version list");
        *self.inner.available_versions.lock().unwrap() = versions;
        self.inner.versions_received.set();
    }

    fn on_receive_latest(&self, body: serde_json::Value) {
        let latest: Option<String> = serde_json::from_value(body).unwrap_or(None);
        tracing::info!(latest = latest.as_deref().unwrap_or("<none>"), "received latest version");
        *self.inner.latest_version.lock().unwrap() = latest;
        self.inner.latest_received.set();
    }

    /// Receive the announced files into the stage, verifying each against
    /// the manifest entry as it lands. A failed file is deleted and the
    /// error recorded so the waiting `download_update` call reports it even
    /// though the server may still send `__download_complete__`.
    async fn on_download_start(
        &self,
        cmdr: Commander,
        body: serde_json::Value,
        serial: u64,
    ) -> anyhow::Result<()> {
        let start: DownloadStart = serde_json::from_value(body)?;
        // the version names the stage directory, so it must parse cleanly
        if start.version.parse::<Version>().is_err() {
            anyhow::bail!("refusing download_start with bad version {:?}", start.version);
        }
        tracing::info!(
            version = %start.version,
            files = start.file_count,
            total = start.total_size,
            "download starting"
        );

        let stage = self.inner.options.update_path.join(&start.version);
        std::fs::create_dir_all(&stage)?;

        for entry in &start.files {
            if let Err(e) = self.receive_one(cmdr.endpoint(), &stage, entry, serial).await {
                tracing::error!(path = %entry.path, error = %e, "file receive failed");
                *self.inner.download_error.lock().unwrap() = Some(e.to_string());
                return Err(e.into());
            }
        }
        tracing::info!(version = %start.version, "all files received and verified");
        Ok(())
    }

    async fn receive_one(
        &self,
        endpoint: &Endpoint,
        stage: &Path,
        entry: &FileEntry,
        serial: u64,
    ) -> Result<(), UpdateError> {
        let target = stage_target(stage, &entry.path).ok_or_else(|| UpdateError::Integrity {
            path: entry.path.clone(),
            reason: "path escapes the stage directory".into(),
        })?;

        tracing::debug!(path = %entry.path, size = entry.size, "receiving file");
        let result = self.verify_received(endpoint, &target, entry, serial).await;
        if result.is_err() && target.exists() {
            let _ = std::fs::remove_file(&target);
        }
        result
    }

    async fn verify_received(
        &self,
        endpoint: &Endpoint,
        target: &Path,
        entry: &FileEntry,
        serial: u64,
    ) -> Result<(), UpdateError> {
        endpoint.recv_file(target, serial).await?;

        let actual_size = std::fs::metadata(target)
            .map_err(|e| UpdateError::Stage(target.display().to_string(), e))?
            .len();
        if actual_size != entry.size {
            return Err(UpdateError::Integrity {
                path: entry.path.clone(),
                reason: format!("size mismatch: expected {}, got {actual_size}", entry.size),
            });
        }

        let ok = checksum::verify_checksum(target, &entry.checksum).map_err(|e| {
            UpdateError::Integrity {
                path: entry.path.clone(),
                reason: e.to_string(),
            }
        })?;
        if !ok {
            return Err(UpdateError::Integrity {
                path: entry.path.clone(),
                reason: "checksum mismatch".into(),
            });
        }
        tracing::debug!(path = %entry.path, "file verified");
        Ok(())
    }

    fn on_download_complete(&self, body: serde_json::Value) {
        let complete: DownloadComplete = match serde_json::from_value(body) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "malformed download_complete");
                self.inner.download_completed.set();
                return;
            }
        };
        tracing::info!(version = %complete.version, "download complete");

        if complete.version.parse::<Version>().is_err() {
            tracing::warn!(version = %complete.version, "ignoring completion with bad version");
            self.inner.download_completed.set();
            return;
        }

        // a receive-side verification failure wins over the server's
        // completion claim
        if self.inner.download_error.lock().unwrap().is_none() {
            *self.inner.download_status.lock().unwrap() = Some(complete.version.clone());

            let stage = self.inner.options.update_path.join(&complete.version);
            if let Err(e) = install::write_replay_manifest(
                &stage,
                self.inner.options.argv.clone(),
                &complete.version,
            ) {
                // the stage is still installable; apply falls back to
                // defaults without a manifest refresh
                tracing::error!(error = %e, "failed to write replay manifest");
            }
        }
        self.inner.download_completed.set();
    }

    fn on_download_failed(&self, body: serde_json::Value) {
        let error = serde_json::from_value::<TransferError>(body)
            .map(|t| t.error)
            .unwrap_or_else(|_| "unknown server error".to_string());
        tracing::error!(%error, "download failed");
        *self.inner.download_status.lock().unwrap() = None;
        *self.inner.download_error.lock().unwrap() = Some(error);
        self.inner.download_completed.set();
    }

    /// Server-initiated update push. The work runs on its own task: the
    /// download waits on events set by handlers in this receive loop, so
    /// doing it inline would wedge the dispatcher.
    fn on_apply_update(
        &self,
        cmdr: Commander,
        body: serde_json::Value,
        serial: u64,
    ) -> anyhow::Result<()> {
        let request: ForceUpdate = serde_json::from_value(body)?;
        tracing::info!(version = %request.version, restart = request.restart, "update push received");

        let updater = self.clone();
        tokio::spawn(async move {
            let result = async {
                let version = updater.download_update(Some(&request.version), serial).await?;
                updater.install_update(Some(&version)).await?;
                if request.restart {
                    updater.restart_service()?;
                }
                Ok::<_, UpdateError>(())
            }
            .await;

            if let Err(e) = result {
                tracing::error!(version = %request.version, error = %e, "pushed update failed");
                let _ = cmdr
                    .send_command(wire::UPDATE_FAILED, json!({ "error": e.to_string() }), serial)
                    .await;
            }
        });
        Ok(())
    }
}

/// Join a wire-supplied relative path onto the stage, refusing absolute
/// paths and parent traversal.
fn stage_target(stage: &Path, rel: &str) -> Option<PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return None;
    }
    for component in rel_path.components() {
        match component {
            std::path::Component::Normal(_) => {}
            _ => return None,
        }
    }
    Some(stage.join(rel_path))
}

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("timed out waiting for {what} after {after:?}")]
    Timeout { what: &'static str, after: Duration },
    #[error("server reported failure: {0}")]
    ServerError(String),
    #[error("no version selected and no latest version known")]
    NoVersionSelected,
    #[error("integrity check failed for {path}: {reason}")]
    Integrity { path: String, reason: String },
    #[error("stage i/o failed at {0}: {1}")]
    Stage(String, #[source] std::io::Error),
    #[error("cannot determine current executable: {0}")]
    NoExecutable(#[source] std::io::Error),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Net(#[from] NetError),
    #[error(transparent)]
    Install(#[from] InstallError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Version(#[from] VersionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_target_allows_nested_relative_paths() {
        let stage = Path::new("/tmp/stage/1.0.0");
        assert_eq!(
            stage_target(stage, "lib/module.rs"),
            Some(stage.join("lib/module.rs"))
        );
        assert_eq!(stage_target(stage, "agent"), Some(stage.join("agent")));
    }

    #[test]
    fn stage_target_rejects_escapes() {
        let stage = Path::new("/tmp/stage/1.0.0");
        assert!(stage_target(stage, "../outside").is_none());
        assert!(stage_target(stage, "lib/../../outside").is_none());
        assert!(stage_target(stage, "/etc/passwd").is_none());
    }
}
