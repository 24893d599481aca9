//! Snapshot store tests against committed artefacts.
//!
//! Artefacts live in `tests/snapshots/snapshot_store/`. Rerun with
//! `MCP_UPDATE_SNAPSHOTS=1` after an intentional change.

use std::path::Path;

use serde_json::json;

use mcp_harness::error::HarnessError;
use mcp_harness::snapshot::{SnapshotMode, SnapshotStore, StoredSnapshot};

#[test]
fn test_macro_keys_store_by_module_and_name() {
    let store = mcp_harness::snapshot_store!("macro_layout").unwrap();

    assert_eq!(store.test_identity(), "snapshot_store::macro_layout");
    assert_eq!(
        store.root(),
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/snapshots")
    );
    assert!(store.dir().ends_with("tests/snapshots/snapshot_store/macro_layout"));
    assert_eq!(store.mode(), SnapshotMode::from_env());
}

#[tokio::test]
async fn committed() {
    let store = mcp_harness::snapshot_store!("committed").unwrap();

    let tools = json!([
        "add", "echo", "sleep", "fail", "crash", "garbage", "stray", "ping_client", "log", "env"
    ]);
    store.assert_match(&tools, "tools").await.unwrap();
    store
        .assert_match_text("Hello from the fixture server!", "greeting")
        .await
        .unwrap();

    let labels: Vec<String> = store.list_snapshots().await.unwrap().into_iter().collect();
    assert_eq!(labels, ["greeting", "tools"]);
    assert_eq!(
        store.get_snapshot("tools").await.unwrap(),
        Some(StoredSnapshot::Json(tools))
    );
}

#[tokio::test]
async fn test_committed_artefacts_reject_changes() {
    let store = SnapshotStore::new(
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/snapshots"),
        "snapshot_store::committed",
        SnapshotMode::Compare,
    )
    .unwrap();

    let err = store
        .assert_match(&json!(["add", "echo"]), "tools")
        .await
        .unwrap_err();
    let HarnessError::SnapshotMismatch { name, expected, .. } = err else {
        panic!("expected mismatch");
    };
    assert_eq!(name, "snapshot_store::committed/tools");
    assert!(expected.contains("ping_client"));

    // Text comparison is exact: a trailing newline is a difference.
    let err = store
        .assert_match_text("Hello from the fixture server!\n", "greeting")
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::SnapshotMismatch { .. }));
}

#[tokio::test]
async fn test_compare_mode_never_records() {
    let root = tempfile::tempdir().unwrap();
    let store = SnapshotStore::new(root.path(), "suite::first_run", SnapshotMode::Compare).unwrap();

    let err = store.assert_match(&json!({"a": 1}), "value").await.unwrap_err();
    assert!(matches!(err, HarnessError::SnapshotMissing { .. }));
    assert!(store.list_snapshots().await.unwrap().is_empty());
    assert!(!store.dir().exists());
}

#[tokio::test]
async fn test_update_mode_overwrites_changed_values() {
    let root = tempfile::tempdir().unwrap();
    let update = SnapshotStore::new(root.path(), "suite::changing", SnapshotMode::Update).unwrap();

    update.assert_match(&json!({"v": 1}), "value").await.unwrap();
    update.assert_match(&json!({"v": 2}), "value").await.unwrap();

    let compare =
        SnapshotStore::new(root.path(), "suite::changing", SnapshotMode::Compare).unwrap();
    compare.assert_match(&json!({"v": 2}), "value").await.unwrap();

    // No temporary files are left behind.
    let names: Vec<String> = std::fs::read_dir(update.dir())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, ["value.json"]);
}
