//! Basecamp integration test harness.
//!
//! Everything runs in-process over 127.0.0.1 with OS-assigned ports and
//! tempdir-backed catalogs, stages, and install roots, so the suite needs
//! no privileges and no external fixtures.

mod echo;
mod handoff;
mod release;
mod update;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use basecamp_core::checksum::file_checksum;
use basecamp_core::config::BasecampConfig;
use basecamp_core::manifest::{FileEntry, ReleaseStatus, VersionManifest};
use basecamp_net::Commander;
use basecamp_runtime::ServiceHost;
use basecamp_update::{ReleaseStore, Releaser, Updater, UpdaterOptions};

// ── Catalog fixtures ──────────────────────────────────────────────────────────

/// Write a version directory with real files and a manifest carrying real
/// sizes and SHA-256 checksums.
pub fn seed_release(
    catalog: &Path,
    version: &str,
    status: ReleaseStatus,
    files: &[(&str, Vec<u8>)],
) -> PathBuf {
    let version_dir = catalog.join(version);
    std::fs::create_dir_all(&version_dir).unwrap();

    let mut entries = Vec::new();
    for (rel, content) in files {
        let path = version_dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        entries.push(FileEntry {
            path: rel.to_string(),
            size: content.len() as u64,
            checksum: file_checksum(&path).unwrap(),
        });
    }

    let mut manifest = VersionManifest::draft(version, entries, vec![]);
    manifest.status = status;
    manifest.store(&version_dir).unwrap();
    version_dir
}

/// Deterministic filler for multi-chunk files.
pub fn patterned_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

// ── Server / client wiring ────────────────────────────────────────────────────

/// Start a release server over `catalog` on an ephemeral port.
/// Returns the commander (keep it alive) and the port.
pub async fn start_release_server(catalog: &Path) -> (Commander, Releaser, u16) {
    let server = Commander::new();
    let listener = server.bind("127.0.0.1", 0).await.unwrap();
    let port = server.endpoint().listener_addr(listener).unwrap().port();
    let releaser = Releaser::attach(&server, ReleaseStore::open(catalog).unwrap()).unwrap();
    (server, releaser, port)
}

/// An update client rooted at `install_root`, connected to a releaser.
pub struct TestClient {
    pub cmdr: Commander,
    pub host: ServiceHost,
    pub updater: Updater,
    pub serial: u64,
}

/// Prepare an install root (current files + config at `current_version`)
/// and connect an updater to the server on `port`.
pub async fn connect_client(install_root: &Path, current_version: &str, port: u16) -> TestClient {
    std::fs::write(install_root.join("agent"), format!("installed binary {current_version}"))
        .unwrap();
    let config_path = install_root.join("basecamp.toml");
    let mut config = BasecampConfig::default();
    config.service.version = current_version.to_string();
    config.store(&config_path).unwrap();

    let host = ServiceHost::new("TestAgent", install_root, Some(config_path.clone())).unwrap();

    let cmdr = Commander::new();
    let serial = cmdr.connect("127.0.0.1", port).await.unwrap();

    let options = UpdaterOptions {
        install_root: install_root.to_path_buf(),
        update_path: install_root.join("updates"),
        config_path,
        current_version: current_version.to_string(),
        argv: vec!["agent".to_string(), "run".to_string(), "-l".to_string(), "debug".to_string()],
        timeout: Duration::from_secs(10),
    };
    let updater = Updater::attach(&cmdr, Arc::new(host.clone()), options).unwrap();

    TestClient {
        cmdr,
        host,
        updater,
        serial,
    }
}

/// Assert a stage file matches its manifest entry byte-for-byte.
pub fn assert_entry_matches(stage: &Path, entry: &FileEntry) {
    let path = stage.join(&entry.path);
    assert!(path.is_file(), "missing stage file {}", entry.path);
    let size = std::fs::metadata(&path).unwrap().len();
    assert_eq!(size, entry.size, "size mismatch for {}", entry.path);
    let checksum = file_checksum(&path).unwrap();
    assert_eq!(checksum, entry.checksum, "checksum mismatch for {}", entry.path);
}
