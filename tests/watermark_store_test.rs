// ABOUTME: WatermarkStore tests over the local-file backend
// ABOUTME: Document layout, persistence across instances, and concurrent updates within one process

use std::sync::Arc;

use tempfile::tempdir;
use warehouse_replicator::state::{LocalFileBackend, WatermarkStore};

fn store(path: &std::path::Path) -> WatermarkStore {
    WatermarkStore::new(Arc::new(LocalFileBackend::new(path)))
}

#[tokio::test]
async fn test_document_layout_on_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state").join("state.json");
    let watermarks = store(&path);

    watermarks.set("orders", "2024-05-01 10:00:00").await.unwrap();
    watermarks.set("events", "1042").await.unwrap();

    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(
        written,
        serde_json::json!({
            "last_sync": {
                "events": "1042",
                "orders": "2024-05-01 10:00:00"
            }
        })
    );
}

#[tokio::test]
async fn test_watermarks_survive_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.json");

    store(&path).set("orders", "7").await.unwrap();

    let reopened = store(&path);
    assert_eq!(reopened.get("orders").await.unwrap().as_deref(), Some("7"));
    assert_eq!(reopened.get("missing").await.unwrap(), None);
}

#[tokio::test]
async fn test_set_replaces_only_its_own_key() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(
        &path,
        r#"{"last_sync": {"legacy": "2023-01-01 00:00:00"}, "owner": "ops"}"#,
    )
    .unwrap();

    let watermarks = store(&path);
    watermarks.set("orders", "9").await.unwrap();

    let snapshot = watermarks.snapshot().await.unwrap();
    assert_eq!(snapshot.get("legacy").map(String::as_str), Some("2023-01-01 00:00:00"));
    assert_eq!(snapshot.get("orders").map(String::as_str), Some("9"));

    // Unknown top-level fields are carried through rewrites.
    let written: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(written["owner"], "ops");
}

#[tokio::test]
async fn test_concurrent_sets_on_one_store_keep_every_key() {
    let dir = tempdir().unwrap();
    let watermarks = Arc::new(store(&dir.path().join("state.json")));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let watermarks = watermarks.clone();
            tokio::spawn(async move {
                watermarks
                    .set(&format!("mapping_{}", i), &i.to_string())
                    .await
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let snapshot = watermarks.snapshot().await.unwrap();
    assert_eq!(snapshot.len(), 8);
    for i in 0..8 {
        assert_eq!(snapshot[&format!("mapping_{}", i)], i.to_string());
    }
}

#[tokio::test]
async fn test_empty_file_reads_as_empty_document() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, "").unwrap();

    let watermarks = store(&path);
    assert_eq!(watermarks.get("orders").await.unwrap(), None);
    watermarks.set("orders", "1").await.unwrap();
    assert_eq!(watermarks.get("orders").await.unwrap().as_deref(), Some("1"));
}
