//! Releaser — the server side of the update protocol.
//!
//! Attaching a releaser to a commander registers the four serving commands;
//! nothing else is needed for a process to act as a release host. The
//! catalog is re-scanned on every request so a release approved while the
//! server runs is immediately visible.

use std::sync::Arc;

use serde_json::json;

use basecamp_core::wire::{self, DownloadRequest, ForceUpdate};
use basecamp_net::{CommandError, Commander};

use crate::store::ReleaseStore;

#[derive(Clone)]
pub struct Releaser {
    inner: Arc<Inner>,
}

struct Inner {
    store: ReleaseStore,
    cmdr: Commander,
}

impl Releaser {
    /// Register the serving commands on `cmdr`.
    pub fn attach(cmdr: &Commander, store: ReleaseStore) -> Result<Self, CommandError> {
        let releaser = Self {
            inner: Arc::new(Inner {
                store,
                cmdr: cmdr.clone(),
            }),
        };

        {
            let r = releaser.clone();
            cmdr.register(wire::REQUEST_VERSIONS, move |cmdr, _body, serial| {
                let r = r.clone();
                async move { r.cmd_request_versions(cmdr, serial).await }
            })?;
        }
        {
            let r = releaser.clone();
            cmdr.register(wire::REQUEST_LATEST_VERSION, move |cmdr, _body, serial| {
                let r = r.clone();
                async move { r.cmd_request_latest_version(cmdr, serial).await }
            })?;
        }
        {
            let r = releaser.clone();
            cmdr.register(wire::DOWNLOAD_UPDATE, move |cmdr, body, serial| {
                let r = r.clone();
                async move { r.cmd_download_update(cmdr, body, serial).await }
            })?;
        }
        {
            let r = releaser.clone();
            cmdr.register(wire::FORCE_UPDATE, move |cmdr, body, serial| {
                let r = r.clone();
                async move { r.cmd_force_update(cmdr, body, serial).await }
            })?;
        }

        let versions = releaser.inner.store.scan();
        tracing::info!(
            count = versions.len(),
            ?versions,
            "releaser attached"
        );
        Ok(releaser)
    }

    pub fn store(&self) -> &ReleaseStore {
        &self.inner.store
    }

    /// Instruct the peer on `serial` to fetch and install `version`.
    /// This is the operator-facing entry for the push channel; the
    /// `__force_update__` command goes through the same validation.
    pub async fn push_update(
        &self,
        version: &str,
        restart: bool,
        serial: u64,
    ) -> Result<(), CommandError> {
        let versions = self.inner.store.scan();
        if !versions.iter().any(|v| v == version) {
            return Err(CommandError::Handler(anyhow::anyhow!(
                "version {version} is not in the approved set (available: {versions:?})"
            )));
        }
        self.inner
            .cmdr
            .send_command(
                wire::APPLY_UPDATE,
                json!({ "version": version, "restart": restart }),
                serial,
            )
            .await
    }

    // ── Command handlers ─────────────────────────────────────────────────────

    async fn cmd_request_versions(&self, cmdr: Commander, serial: u64) -> anyhow::Result<()> {
        let versions = self.inner.store.scan();
        tracing::info!(serial, count = versions.len(), "version list requested");
        cmdr.send_command(wire::RECEIVE_VERSIONS, json!(versions), serial)
            .await?;
        Ok(())
    }

    async fn cmd_request_latest_version(&self, cmdr: Commander, serial: u64) -> anyhow::Result<()> {
        let latest = self.inner.store.latest();
        tracing::info!(serial, latest = latest.as_deref().unwrap_or("<none>"), "latest version requested");
        cmdr.send_command(wire::RECEIVE_LATEST_VERSION, json!(latest), serial)
            .await?;
        Ok(())
    }

    async fn cmd_download_update(
        &self,
        cmdr: Commander,
        body: serde_json::Value,
        serial: u64,
    ) -> anyhow::Result<()> {
        let request: DownloadRequest = match serde_json::from_value(body) {
            Ok(r) => r,
            Err(e) => {
                cmdr.send_command(
                    wire::DOWNLOAD_FAILED,
                    json!({ "error": format!("bad download request: {e}") }),
                    serial,
                )
                .await?;
                return Ok(());
            }
        };
        let version = request.version;
        tracing::info!(serial, %version, "download requested");

        let versions = self.inner.store.scan();
        if !versions.iter().any(|v| *v == version) {
            cmdr.send_command(
                wire::DOWNLOAD_FAILED,
                json!({ "error": format!("version not found: {version}") }),
                serial,
            )
            .await?;
            return Ok(());
        }

        if let Err(e) = self.stream_bundle(&cmdr, &version, serial).await {
            tracing::error!(serial, %version, error = %e, "bundle transfer failed");
            cmdr.send_command(
                wire::DOWNLOAD_FAILED,
                json!({ "error": e.to_string() }),
                serial,
            )
            .await?;
        }
        Ok(())
    }

    /// Send `__download_start__`, every file in manifest order, then
    /// `__download_complete__`.
    async fn stream_bundle(
        &self,
        cmdr: &Commander,
        version: &str,
        serial: u64,
    ) -> anyhow::Result<()> {
        let manifest = self.inner.store.manifest(version)?;
        if manifest.files.is_empty() {
            anyhow::bail!("version {version} has no files");
        }

        let total_size = manifest.total_size();
        let file_count = manifest.files.len();
        tracing::info!(
            serial,
            version,
            file_count,
            total_size,
            "sending bundle"
        );

        cmdr.send_command(
            wire::DOWNLOAD_START,
            json!({
                "version": version,
                "files": &manifest.files,
                "total_size": total_size,
                "file_count": file_count,
            }),
            serial,
        )
        .await?;

        let version_dir = self.inner.store.version_dir(version)?;
        for entry in &manifest.files {
            let path = version_dir.join(&entry.path);
            if !path.is_file() {
                anyhow::bail!("bundle file missing on disk: {}", entry.path);
            }
            tracing::debug!(serial, path = %entry.path, size = entry.size, "sending file");
            cmdr.endpoint().send_file(&path, serial).await?;
        }

        cmdr.send_command(
            wire::DOWNLOAD_COMPLETE,
            json!({ "version": version, "file_count": file_count }),
            serial,
        )
        .await?;
        tracing::info!(serial, version, file_count, "bundle sent");
        Ok(())
    }

    async fn cmd_force_update(
        &self,
        cmdr: Commander,
        body: serde_json::Value,
        serial: u64,
    ) -> anyhow::Result<()> {
        let request: ForceUpdate = match serde_json::from_value(body) {
            Ok(r) => r,
            Err(e) => {
                cmdr.send_command(
                    wire::UPDATE_FAILED,
                    json!({ "error": format!("bad force_update request: {e}") }),
                    serial,
                )
                .await?;
                return Ok(());
            }
        };
        tracing::info!(serial, version = %request.version, restart = request.restart, "force update");

        let versions = self.inner.store.scan();
        if !versions.iter().any(|v| *v == request.version) {
            let error = format!(
                "version {} is not in the approved set (available: {versions:?})",
                request.version
            );
            tracing::error!(serial, %error, "force update refused");
            cmdr.send_command(wire::UPDATE_FAILED, json!({ "error": error }), serial)
                .await?;
            return Ok(());
        }

        cmdr.send_command(
            wire::APPLY_UPDATE,
            json!({ "version": request.version, "restart": request.restart }),
            serial,
        )
        .await?;
        Ok(())
    }
}
