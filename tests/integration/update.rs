//! Download path: multi-file streamed transfer, verification, failure
//! envelopes, and the server-initiated push.

use std::time::Duration;

use basecamp_core::manifest::{ReleaseStatus, SavedArgs};
use basecamp_update::UpdateError;
use serde_json::json;

use crate::{connect_client, patterned_bytes, seed_release, start_release_server};

#[tokio::test]
async fn full_download_with_verification() {
    let catalog = tempfile::tempdir().unwrap();
    // three files, ~1.5 MB total, one nested — forces multi-frame transfer
    let files = vec![
        ("agent", patterned_bytes(900_000, 1)),
        ("lib/module.rs", patterned_bytes(500_000, 2)),
        ("share/readme.txt", patterned_bytes(100_000, 3)),
    ];
    seed_release(catalog.path(), "1.0.0", ReleaseStatus::Approved, &files);

    let (server, releaser, port) = start_release_server(catalog.path()).await;
    let install_root = tempfile::tempdir().unwrap();
    let client = connect_client(install_root.path(), "0.9.0", port).await;

    assert!(client.updater.check_update(client.serial).await.unwrap());

    let version = tokio::time::timeout(
        Duration::from_secs(10),
        client.updater.download_update(None, client.serial),
    )
    .await
    .expect("download did not finish within 10s")
    .unwrap();
    assert_eq!(version, "1.0.0");

    // every manifest entry exists in the stage with matching size and hash
    let manifest = releaser.store().manifest("1.0.0").unwrap();
    assert_eq!(manifest.files.len(), 3);
    let stage = install_root.path().join("updates/1.0.0");
    for entry in &manifest.files {
        crate::assert_entry_matches(&stage, entry);
    }

    // the replay manifest was recorded alongside the download
    let saved = SavedArgs::load(&stage).unwrap();
    assert_eq!(saved.version, "1.0.0");
    assert_eq!(saved.argv[0], "agent");

    client.cmdr.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn download_of_unknown_version_fails_with_server_error() {
    let catalog = tempfile::tempdir().unwrap();
    seed_release(catalog.path(), "1.0.0", ReleaseStatus::Approved, &[("agent", b"v10".to_vec())]);

    let (server, _releaser, port) = start_release_server(catalog.path()).await;
    let install_root = tempfile::tempdir().unwrap();
    let client = connect_client(install_root.path(), "0.9.0", port).await;

    let err = client
        .updater
        .download_update(Some("9.9.9"), client.serial)
        .await
        .unwrap_err();
    match err {
        UpdateError::ServerError(message) => {
            assert!(message.contains("9.9.9"), "unhelpful error: {message}")
        }
        other => panic!("expected ServerError, got {other:?}"),
    }

    // the connection survives the failure and can be used again
    let versions = client.updater.fetch_versions(client.serial).await.unwrap();
    assert_eq!(versions, vec!["1.0.0"]);

    client.cmdr.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn draft_version_is_not_downloadable() {
    let catalog = tempfile::tempdir().unwrap();
    seed_release(catalog.path(), "1.0.0", ReleaseStatus::Draft, &[("agent", b"v10".to_vec())]);

    let (server, _releaser, port) = start_release_server(catalog.path()).await;
    let install_root = tempfile::tempdir().unwrap();
    let client = connect_client(install_root.path(), "0.9.0", port).await;

    let err = client
        .updater
        .download_update(Some("1.0.0"), client.serial)
        .await
        .unwrap_err();
    assert!(matches!(err, UpdateError::ServerError(_)));

    client.cmdr.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn corrupted_transfer_is_rejected_by_checksum() {
    let catalog = tempfile::tempdir().unwrap();
    let version_dir = seed_release(
        catalog.path(),
        "1.0.0",
        ReleaseStatus::Approved,
        &[("agent", patterned_bytes(10_000, 7))],
    );
    // corrupt the file after the manifest was computed, keeping the size
    let mut bytes = std::fs::read(version_dir.join("agent")).unwrap();
    bytes[5000] ^= 0xFF;
    std::fs::write(version_dir.join("agent"), &bytes).unwrap();

    let (server, _releaser, port) = start_release_server(catalog.path()).await;
    let install_root = tempfile::tempdir().unwrap();
    let client = connect_client(install_root.path(), "0.9.0", port).await;

    let err = client
        .updater
        .download_update(Some("1.0.0"), client.serial)
        .await
        .unwrap_err();
    match &err {
        UpdateError::ServerError(message) => {
            assert!(message.contains("checksum"), "wrong failure: {message}")
        }
        other => panic!("expected checksum failure, got {other:?}"),
    }

    // the poisoned file was deleted from the stage
    let staged = install_root.path().join("updates/1.0.0/agent");
    assert!(!staged.exists(), "partial file left in stage");

    client.cmdr.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn force_update_push_downloads_and_installs() {
    let catalog = tempfile::tempdir().unwrap();
    seed_release(
        catalog.path(),
        "1.0.0",
        ReleaseStatus::Approved,
        &[
            ("agent", b"installed binary 1.0.0".to_vec()),
            ("lib/module.rs", b"library 1.0.0".to_vec()),
        ],
    );

    let (server, releaser, port) = start_release_server(catalog.path()).await;
    let install_root = tempfile::tempdir().unwrap();
    let client = connect_client(install_root.path(), "0.9.0", port).await;

    // find the server-side serial for this client connection
    let server_serial = loop {
        if let Some(&serial) = server.endpoint().data_serials().first() {
            break serial;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    // push without restart so the handoff is not triggered in-test
    releaser.push_update("1.0.0", false, server_serial).await.unwrap();

    // the client downloads and installs on its own task
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if client.updater.current_version() == "1.0.0" {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "pushed update never applied");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    if !cfg!(windows) {
        assert_eq!(
            std::fs::read(install_root.path().join("agent")).unwrap(),
            b"installed binary 1.0.0"
        );
        assert_eq!(
            std::fs::read(install_root.path().join("lib/module.rs")).unwrap(),
            b"library 1.0.0"
        );
    }

    client.cmdr.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn force_update_of_unapproved_version_reports_failure() {
    let catalog = tempfile::tempdir().unwrap();
    seed_release(catalog.path(), "1.0.0", ReleaseStatus::Draft, &[("agent", b"v10".to_vec())]);

    let (server, _releaser, port) = start_release_server(catalog.path()).await;

    // a bare commander acting as the operator side
    let operator = basecamp_net::Commander::new();
    let serial = operator.connect("127.0.0.1", port).await.unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel::<String>();
    let tx = std::sync::Mutex::new(Some(tx));
    operator
        .register("__update_failed__", move |_, body, _| {
            let sender = tx.lock().unwrap().take();
            async move {
                if let Some(sender) = sender {
                    let _ = sender.send(body["error"].as_str().unwrap_or("").to_string());
                }
                Ok(())
            }
        })
        .unwrap();

    operator
        .send_command("__force_update__", json!({ "version": "1.0.0" }), serial)
        .await
        .unwrap();

    let error = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("no __update_failed__ reply")
        .unwrap();
    assert!(error.contains("1.0.0"), "unhelpful error: {error}");

    operator.shutdown().await;
    server.shutdown().await;
}
