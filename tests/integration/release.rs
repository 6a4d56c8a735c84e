//! Catalog serving: status filtering, approval workflow, rollback marking.

use basecamp_core::manifest::{ReleaseStatus, VersionManifest};
use basecamp_runtime::Builder;
use basecamp_update::ReleaseStore;

use crate::{connect_client, seed_release, start_release_server};

#[tokio::test]
async fn version_list_serves_only_approved_in_order() {
    let catalog = tempfile::tempdir().unwrap();
    seed_release(catalog.path(), "0.9.0", ReleaseStatus::Draft, &[("agent", b"v09".to_vec())]);
    seed_release(catalog.path(), "1.0.0", ReleaseStatus::Approved, &[("agent", b"v10".to_vec())]);
    seed_release(catalog.path(), "1.1.0", ReleaseStatus::Approved, &[("agent", b"v11".to_vec())]);

    let (server, _releaser, port) = start_release_server(catalog.path()).await;
    let install_root = tempfile::tempdir().unwrap();
    let client = connect_client(install_root.path(), "0.9.0", port).await;

    let versions = client.updater.fetch_versions(client.serial).await.unwrap();
    assert_eq!(versions, vec!["1.0.0", "1.1.0"]);

    let latest = client.updater.fetch_latest_version(client.serial).await.unwrap();
    assert_eq!(latest.as_deref(), Some("1.1.0"));

    client.cmdr.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn empty_catalog_reports_no_update() {
    let catalog = tempfile::tempdir().unwrap();
    let (server, _releaser, port) = start_release_server(catalog.path()).await;
    let install_root = tempfile::tempdir().unwrap();
    let client = connect_client(install_root.path(), "0.9.0", port).await;

    let versions = client.updater.fetch_versions(client.serial).await.unwrap();
    assert!(versions.is_empty());

    let latest = client.updater.fetch_latest_version(client.serial).await.unwrap();
    assert_eq!(latest, None);

    assert!(!client.updater.check_update(client.serial).await.unwrap());

    client.cmdr.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn approval_workflow_promotes_a_built_draft() {
    let root = tempfile::tempdir().unwrap();
    let dist = root.path().join("dist");
    std::fs::create_dir_all(&dist).unwrap();
    std::fs::write(dist.join("agent"), b"freshly built").unwrap();

    // build: draft, invisible to clients
    let builder = Builder::new("TestAgent", root.path(), None);
    let version_dir = builder.build("1.0.0", Some(&dist), None).unwrap();
    let catalog = builder.release_path().to_path_buf();

    let (server, _releaser, port) = start_release_server(&catalog).await;
    let install_root = tempfile::tempdir().unwrap();
    let client = connect_client(install_root.path(), "0.9.0", port).await;

    let versions = client.updater.fetch_versions(client.serial).await.unwrap();
    assert!(versions.is_empty(), "draft must not be served");

    // approve: visible on the very next request, no server restart
    let store = ReleaseStore::open(&catalog).unwrap();
    store.approve("1.0.0", Some("first"), None).unwrap();

    let manifest = VersionManifest::load(&version_dir).unwrap();
    assert_eq!(manifest.status, ReleaseStatus::Approved);
    assert_eq!(manifest.release_notes, "first");

    let versions = client.updater.fetch_versions(client.serial).await.unwrap();
    assert_eq!(versions, vec!["1.0.0"]);

    client.cmdr.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn rollback_marks_deprecated_and_hides_version() {
    let catalog = tempfile::tempdir().unwrap();
    seed_release(catalog.path(), "0.9.0", ReleaseStatus::Approved, &[("agent", b"v09".to_vec())]);
    seed_release(catalog.path(), "1.0.0", ReleaseStatus::Approved, &[("agent", b"v10".to_vec())]);

    let store = ReleaseStore::open(catalog.path()).unwrap();
    store.rollback("1.0.0", "0.9.0").unwrap();

    let rolled = store.manifest("1.0.0").unwrap();
    assert_eq!(rolled.status, ReleaseStatus::Deprecated);
    assert_eq!(rolled.rollback_target.as_deref(), Some("0.9.0"));

    let kept = store.manifest("0.9.0").unwrap();
    assert_eq!(kept.status, ReleaseStatus::Approved);
    assert_eq!(kept.rollback_target, None);

    let (server, _releaser, port) = start_release_server(catalog.path()).await;
    let install_root = tempfile::tempdir().unwrap();
    let client = connect_client(install_root.path(), "0.5.0", port).await;

    let versions = client.updater.fetch_versions(client.serial).await.unwrap();
    assert_eq!(versions, vec!["0.9.0"]);

    client.cmdr.shutdown().await;
    server.shutdown().await;
}
