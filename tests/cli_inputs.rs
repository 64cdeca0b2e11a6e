//! Tests for the tap's input files and discovery output.

use std::fs;

use checkpoint::{CheckpointState, FilesystemStore, NullStore, PartitionOffsets, StateStore};
use serde_json::json;
use tap_kafka::{discover, load_catalog, load_config, load_state, sync, SyncArgs};
use tap_kafka_source::{Error, LocalBuffer};
use tokio::sync::watch;
use tempfile::TempDir;

fn write_json(dir: &TempDir, name: &str, value: serde_json::Value) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
    path
}

#[test]
fn test_load_config_with_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write_json(
        &dir,
        "config.json",
        json!({
            "bootstrap_servers": "localhost:9092",
            "group_id": "tap-group",
            "topic": "orders",
            "batch_size_rows": "250"
        }),
    );

    let config = load_config(&path).unwrap();
    assert_eq!(config.bootstrap_servers, vec!["localhost:9092"]);
    assert_eq!(config.batch_size_rows, 250);
    assert_eq!(config.max_poll_records, 500);
}

#[test]
fn test_load_config_errors_name_the_file() {
    let dir = TempDir::new().unwrap();
    let path = write_json(&dir, "config.json", json!({"group_id": "g", "topic": "t"}));

    let err = load_config(&path).unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("config.json"));
    assert!(message.contains("bootstrap_servers"));

    assert!(load_config(&dir.path().join("missing.json")).is_err());
}

#[test]
fn test_discovered_catalog_selects_nothing_by_default() {
    let dir = TempDir::new().unwrap();
    let path = write_json(
        &dir,
        "config.json",
        json!({
            "bootstrap_servers": "localhost:9092",
            "group_id": "tap-group",
            "topic": "orders.v1",
            "primary_keys": {"id": "/id"}
        }),
    );
    let config = load_config(&path).unwrap();

    let catalog = discover::catalog_for(&config).unwrap();
    assert_eq!(catalog.streams.len(), 1);
    let entry = &catalog.streams[0];
    assert_eq!(entry.tap_stream_id, config.stream_name());
    assert_eq!(entry.key_properties, vec!["id"]);
    assert!(catalog.selected_stream(&config.stream_name()).is_none());

    // Selecting the stream through metadata makes it eligible for sync.
    let mut selected = serde_json::to_value(&catalog).unwrap();
    selected["streams"][0]["metadata"][0]["metadata"]["selected"] = json!(true);
    let catalog_path = write_json(&dir, "catalog.json", selected);
    let catalog = load_catalog(&catalog_path).unwrap();
    assert!(catalog.selected_stream(&config.stream_name()).is_some());
}

#[tokio::test]
async fn test_state_file_takes_precedence_over_store() {
    let dir = TempDir::new().unwrap();

    let mut stored = CheckpointState::new();
    stored
        .advance("orders", "orders", "g", &PartitionOffsets::from([(0, 5)]))
        .unwrap();
    let store = FilesystemStore::new(dir.path().join("kept.json"));
    store.store_state(&stored).await.unwrap();

    let from_store = load_state(None, &store).await.unwrap();
    assert_eq!(from_store.partition_offsets("orders")[&0], 5);

    let state_file = write_json(
        &dir,
        "state.json",
        json!({"bookmarks": {"orders": {
            "topic": "orders",
            "group_id": "g",
            "partition_offsets": {"0": 42}
        }}}),
    );
    let from_file = load_state(Some(state_file.as_path()), &store).await.unwrap();
    assert_eq!(from_file.partition_offsets("orders")[&0], 42);

    let empty = load_state(None, &NullStore).await.unwrap();
    assert_eq!(empty, CheckpointState::new());
}

#[tokio::test]
async fn test_locked_store_fails_before_joining_the_group() {
    let dir = TempDir::new().unwrap();
    let path = write_json(
        &dir,
        "config.json",
        json!({
            "bootstrap_servers": "127.0.0.1:1",
            "group_id": "tap-group",
            "topic": "orders",
            "local_store_dir": dir.path().join("local-store"),
        }),
    );
    let config = load_config(&path).unwrap();

    let mut catalog = serde_json::to_value(discover::catalog_for(&config).unwrap()).unwrap();
    catalog["streams"][0]["metadata"][0]["metadata"]["selected"] = json!(true);
    let catalog = write_json(&dir, "catalog.json", catalog);

    let _held = LocalBuffer::for_config(&config).unwrap();
    let (_tx, rx) = watch::channel(false);
    let args = SyncArgs {
        catalog,
        state: None,
        state_output: None,
    };

    let err = sync::run(&config, args, rx).await.unwrap_err();
    assert!(
        matches!(err.downcast_ref::<Error>(), Some(Error::BufferLocked(_))),
        "unexpected error: {err:#}"
    );
}
