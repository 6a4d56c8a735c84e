//! Install orchestration and the apply-mode half of the self-replacement
//! handoff, short of the final re-exec.

use std::time::Duration;

use basecamp_core::config::BasecampConfig;
use basecamp_core::manifest::{ReleaseStatus, SAVED_ARGS_FILE};
use basecamp_update::apply;
use basecamp_update::install::BACKUP_PREFIX;

use crate::{connect_client, patterned_bytes, seed_release, start_release_server};

#[tokio::test]
async fn install_backs_up_deploys_and_persists_version() {
    let catalog = tempfile::tempdir().unwrap();
    seed_release(
        catalog.path(),
        "1.0.0",
        ReleaseStatus::Approved,
        &[
            ("agent", b"installed binary 1.0.0".to_vec()),
            ("lib/module.rs", patterned_bytes(4096, 9)),
        ],
    );

    let (server, _releaser, port) = start_release_server(catalog.path()).await;
    let install_root = tempfile::tempdir().unwrap();
    let client = connect_client(install_root.path(), "0.9.0", port).await;
    assert_eq!(client.host.version(), "0.9.0");

    let updated = tokio::time::timeout(
        Duration::from_secs(15),
        client.updater.download_and_install(client.serial, false),
    )
    .await
    .expect("update did not finish")
    .unwrap();
    assert!(updated);

    // backup of the previous top-level files exists
    let backup = std::fs::read_dir(install_root.path())
        .unwrap()
        .flatten()
        .find(|e| e.file_name().to_string_lossy().starts_with(BACKUP_PREFIX))
        .expect("no backup directory created");
    assert_eq!(
        std::fs::read(backup.path().join("agent")).unwrap(),
        b"installed binary 0.9.0",
        "backup must hold the pre-install binary"
    );

    if !cfg!(windows) {
        assert_eq!(
            std::fs::read(install_root.path().join("agent")).unwrap(),
            b"installed binary 1.0.0"
        );
        assert!(install_root.path().join("lib/module.rs").exists());
    }

    // the persisted version is the target version
    let config = BasecampConfig::load(&install_root.path().join("basecamp.toml")).unwrap();
    assert_eq!(config.service.version, "1.0.0");
    assert_eq!(client.updater.current_version(), "1.0.0");

    client.cmdr.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn apply_consumes_stage_and_preserves_argv() {
    let catalog = tempfile::tempdir().unwrap();
    seed_release(
        catalog.path(),
        "1.1.0",
        ReleaseStatus::Approved,
        &[
            ("agent", b"installed binary 1.1.0".to_vec()),
            ("lib/module.rs", b"library 1.1.0".to_vec()),
        ],
    );

    let (server, _releaser, port) = start_release_server(catalog.path()).await;
    let install_root = tempfile::tempdir().unwrap();
    let client = connect_client(install_root.path(), "1.0.0", port).await;

    client
        .updater
        .download_update(Some("1.1.0"), client.serial)
        .await
        .unwrap();
    client.updater.install_update(Some("1.1.0")).await.unwrap();

    // what the successor does in apply mode, minus the re-exec
    let update_root = install_root.path().join("updates");
    let stage = apply::find_latest_stage(&update_root).unwrap().expect("no stage found");
    assert_eq!(stage, update_root.join("1.1.0"));

    let saved = apply::apply_stage(&stage, install_root.path()).unwrap();

    assert_eq!(saved.version, "1.1.0");
    // run-mode argv is replayed unchanged
    assert_eq!(
        apply::normalize_replay_argv(&saved.argv),
        vec!["agent", "run", "-l", "debug"]
    );

    // install root now carries the new tree
    assert_eq!(
        std::fs::read(install_root.path().join("agent")).unwrap(),
        b"installed binary 1.1.0"
    );
    assert_eq!(
        std::fs::read(install_root.path().join("lib/module.rs")).unwrap(),
        b"library 1.1.0"
    );

    // consumed exactly once: gone from the stage, never copied to the root
    assert!(!stage.join(SAVED_ARGS_FILE).exists());
    assert!(!install_root.path().join(SAVED_ARGS_FILE).exists());

    client.cmdr.shutdown().await;
    server.shutdown().await;
}
