//! Consume loop tests against an in-memory topic.
//!
//! Time is paused, so idle waits and flush intervals complete instantly
//! while still being observable through `tokio::time::Instant`.

mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use checkpoint::{CheckpointState, FilesystemStore, NullStore, PartitionOffsets, StateStore};
use common::{catalog_entry, config, init_logging, CollectingSink, Output};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use tap_kafka_source::{
    Error, LocalBuffer, MemorySource, SyncEngine, TerminationReason, TopicConfig,
};
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::time::Instant;

fn fill(source: &MemorySource, partition: i32, count: usize) {
    for i in 0..count {
        source.push(partition, json!({"id": i, "partition": partition}).to_string());
    }
}

async fn run(
    config: &TopicConfig,
    source: MemorySource,
    sink: CollectingSink,
    store: Box<dyn StateStore>,
    initial: CheckpointState,
) -> tap_kafka_source::Result<tap_kafka_source::SyncSummary> {
    let (_tx, rx) = watch::channel(false);
    let buffer = LocalBuffer::for_config(config)?;
    SyncEngine::new(config, catalog_entry(), buffer, source, sink, store, rx)?
        .run(initial)
        .await
}

// =============================================================================
// Batching and checkpoints
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_batches_followed_by_state() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let config = config(dir.path(), json!({}));
    let source = MemorySource::new();
    fill(&source, 0, 2500);
    let sink = CollectingSink::new();

    let summary = run(
        &config,
        source.clone(),
        sink.clone(),
        Box::new(NullStore),
        CheckpointState::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.batches, 3);
    assert_eq!(summary.records_emitted, 2500);
    assert_eq!(summary.reason, TerminationReason::Idle);

    let outputs = sink.outputs();
    assert!(matches!(&outputs[0], Output::Schema(stream) if stream == "orders"));

    let sizes: Vec<usize> = sink.batches().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![1000, 1000, 500]);

    // Every batch is directly followed by the state covering it.
    let kinds: Vec<&str> = outputs[1..]
        .iter()
        .map(|o| match o {
            Output::Records { .. } => "records",
            Output::State(_) => "state",
            Output::Schema(_) => "schema",
        })
        .collect();
    assert_eq!(
        kinds,
        vec!["records", "state", "records", "state", "records", "state"]
    );

    let watermarks: Vec<i64> = sink.states().iter().map(|s| s[&0]).collect();
    assert_eq!(watermarks, vec![999, 1999, 2499]);

    assert_eq!(source.committed_offsets(), PartitionOffsets::from([(0, 2499)]));
}

#[tokio::test(start_paused = true)]
async fn test_store_purged_per_checkpoint_while_group_commits_are_throttled() {
    let dir = TempDir::new().unwrap();
    let config = config(
        dir.path(),
        json!({"batch_size_rows": 10, "commit_interval_ms": 600_000}),
    );
    let source = MemorySource::new();
    fill(&source, 0, 25);
    let sink = CollectingSink::new();

    run(
        &config,
        source.clone(),
        sink.clone(),
        Box::new(NullStore),
        CheckpointState::new(),
    )
    .await
    .unwrap();

    let watermarks: Vec<i64> = sink.states().iter().map(|s| s[&0]).collect();
    assert_eq!(watermarks, vec![9, 19, 24]);
    // Only the final commit reaches the group.
    assert_eq!(source.commits(), vec![PartitionOffsets::from([(0, 24)])]);
    assert!(LocalBuffer::for_config(&config)
        .unwrap()
        .replay_pending()
        .unwrap()
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_batch_never_exceeds_row_bound() {
    let dir = TempDir::new().unwrap();
    let config = config(
        dir.path(),
        json!({"batch_size_rows": 7, "max_poll_records": 50}),
    );
    let source = MemorySource::new();
    let mut rng = StdRng::seed_from_u64(7);
    let mut total = 0;
    for partition in 0..3 {
        let count = rng.random_range(20..120);
        fill(&source, partition, count);
        total += count;
    }
    let sink = CollectingSink::new();

    run(
        &config,
        source.clone(),
        sink.clone(),
        Box::new(NullStore),
        CheckpointState::new(),
    )
    .await
    .unwrap();

    assert!(sink.batches().iter().all(|b| !b.is_empty() && b.len() <= 7));

    // No state may cover an offset that was not emitted before it.
    let mut emitted = BTreeSet::new();
    for output in sink.outputs() {
        match output {
            Output::Records { records, .. } => {
                emitted.extend(records.iter().map(common::position));
            }
            Output::State(state) => {
                for (partition, offset) in state.partition_offsets(common::STREAM) {
                    assert!(emitted.contains(&(partition, offset)));
                }
            }
            Output::Schema(_) => {}
        }
    }
    assert_eq!(emitted.len(), total);
    assert_eq!(source.delivered(), total);
}

#[tokio::test(start_paused = true)]
async fn test_time_bound_flush_when_starved() {
    let dir = TempDir::new().unwrap();
    let config = config(
        dir.path(),
        json!({"batch_flush_interval_ms": 2000, "consumer_timeout_ms": 10000}),
    );
    let source = MemorySource::new();
    fill(&source, 0, 5);
    let sink = CollectingSink::new();

    let started = Instant::now();
    let summary = run(
        &config,
        source,
        sink.clone(),
        Box::new(NullStore),
        CheckpointState::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.batches, 1);
    let flushed_at = sink
        .outputs()
        .into_iter()
        .find_map(|o| match o {
            Output::Records { at, .. } => Some(at.duration_since(started)),
            _ => None,
        })
        .unwrap();
    assert!(flushed_at >= Duration::from_secs(2));
    assert!(flushed_at < Duration::from_secs(10));
}

// =============================================================================
// Poisoned messages
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_undecodable_message_is_skipped() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path(), json!({}));
    let source = MemorySource::new();
    source.push(0, r#"{"id": 1}"#);
    source.push(0, "not json");
    source.push(0, r#"{"id": 3}"#);
    source.push(0, vec![0xff, 0xfe]);
    let sink = CollectingSink::new();

    let summary = run(
        &config,
        source.clone(),
        sink.clone(),
        Box::new(NullStore),
        CheckpointState::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.records_skipped, 2);
    assert_eq!(sink.positions(), vec![(0, 0), (0, 2)]);
    // The trailing poisoned offset is still checkpointed.
    assert_eq!(sink.states().last().unwrap()[&0], 3);
    assert_eq!(source.committed_offsets()[&0], 3);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_registry_skips_messages() {
    let dir = TempDir::new().unwrap();
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let registry = format!("http://{}", closed.local_addr().unwrap());
    drop(closed);

    let config = config(dir.path(), json!({"avro_schema": registry}));
    let source = MemorySource::new();
    source.push(0, vec![0u8, 0, 0, 0, 1, 2, 4]);
    source.push(0, vec![0u8, 0, 0, 0, 1, 6, 8]);
    let sink = CollectingSink::new();

    let summary = run(
        &config,
        source.clone(),
        sink.clone(),
        Box::new(NullStore),
        CheckpointState::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.records_skipped, 2);
    assert_eq!(summary.reason, TerminationReason::Idle);
    assert!(sink.records().is_empty());
    assert_eq!(sink.states().last().unwrap()[&0], 1);
    assert_eq!(source.committed_offsets()[&0], 1);
}

#[tokio::test(start_paused = true)]
async fn test_missing_primary_key_is_skipped() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path(), json!({"primary_keys": {"id": "/id"}}));
    let source = MemorySource::new();
    source.push(0, r#"{"id": 1}"#);
    source.push(0, r#"{"name": "no id"}"#);
    let sink = CollectingSink::new();

    run(
        &config,
        source,
        sink.clone(),
        Box::new(NullStore),
        CheckpointState::new(),
    )
    .await
    .unwrap();

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["id"], json!(1));
}

// =============================================================================
// Termination
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_max_runtime_flushes_open_batch() {
    let dir = TempDir::new().unwrap();
    let config = config(
        dir.path(),
        json!({"max_runtime_ms": 5000, "consumer_timeout_ms": 60000}),
    );
    let source = MemorySource::new();
    fill(&source, 0, 10);
    let sink = CollectingSink::new();

    let started = Instant::now();
    let summary = run(
        &config,
        source,
        sink.clone(),
        Box::new(NullStore),
        CheckpointState::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.reason, TerminationReason::MaxRuntime);
    assert_eq!(summary.records_emitted, 10);
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(started.elapsed() < Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_before_start() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path(), json!({}));
    let source = MemorySource::new();
    fill(&source, 0, 10);
    let sink = CollectingSink::new();

    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    let summary = SyncEngine::new(
        &config,
        catalog_entry(),
        LocalBuffer::for_config(&config).unwrap(),
        source,
        sink.clone(),
        Box::new(NullStore),
        rx,
    )
    .unwrap()
    .run(CheckpointState::new())
    .await
    .unwrap();

    assert_eq!(summary.reason, TerminationReason::Shutdown);
    assert_eq!(summary.records_emitted, 0);
    assert_eq!(sink.outputs().len(), 1);
}

// =============================================================================
// Emission failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_emission_is_retried() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path(), json!({"max_emit_attempts": 3}));
    let source = MemorySource::new();
    fill(&source, 0, 3);
    let sink = CollectingSink::new();
    sink.fail_next(2);

    let summary = run(
        &config,
        source,
        sink.clone(),
        Box::new(NullStore),
        CheckpointState::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.batches, 1);
    assert_eq!(sink.positions(), vec![(0, 0), (0, 1), (0, 2)]);
}

#[tokio::test(start_paused = true)]
async fn test_emission_gives_up_without_state() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path(), json!({"max_emit_attempts": 3}));
    let source = MemorySource::new();
    fill(&source, 0, 3);
    let sink = CollectingSink::new();
    sink.fail_next(3);

    let err = run(
        &config,
        source.clone(),
        sink.clone(),
        Box::new(NullStore),
        CheckpointState::new(),
    )
    .await
    .unwrap_err();

    match err {
        Error::Emission(e) => assert_eq!(e.attempts, 3),
        other => panic!("unexpected error {other}"),
    }
    assert!(sink.states().is_empty());
    assert!(source.committed_offsets().is_empty());
}

// =============================================================================
// Crash recovery
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_restart_after_failure_has_no_gap_or_duplicate() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let config = config(dir.path(), json!({"max_emit_attempts": 2}));
    let state_path = dir.path().join("state.json");

    let topic = MemorySource::new();
    fill(&topic, 0, 2500);

    // First run: the sink goes down after the first batch.
    let sink = CollectingSink::new();
    sink.fail_after(1);
    let err = run(
        &config,
        topic.clone(),
        sink.clone(),
        Box::new(FilesystemStore::new(&state_path)),
        CheckpointState::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Emission(_)));
    let first_run = sink.positions();
    assert_eq!(first_run.len(), 1000);

    // Second run resumes from the stored state.
    let store = FilesystemStore::new(&state_path);
    let initial = store.read_state().await.unwrap().unwrap();
    assert_eq!(initial.partition_offsets(common::STREAM)[&0], 999);

    let restarted = MemorySource::new().with_committed(topic.committed_offsets());
    fill(&restarted, 0, 2500);
    let sink = CollectingSink::new();
    let summary = run(&config, restarted, sink.clone(), Box::new(store), initial)
        .await
        .unwrap();
    assert!(summary.records_replayed > 0);

    let mut all = first_run;
    all.extend(sink.positions());
    let expected: Vec<(i32, i64)> = (0..2500).map(|o| (0, o)).collect();
    assert_eq!(all, expected);

    let stored = FilesystemStore::new(&state_path)
        .read_state()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.partition_offsets(common::STREAM)[&0], 2499);
}

#[tokio::test(start_paused = true)]
async fn test_local_store_is_exclusive() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path(), json!({}));
    let (_tx, rx) = watch::channel(false);

    let _first = SyncEngine::new(
        &config,
        catalog_entry(),
        LocalBuffer::for_config(&config).unwrap(),
        MemorySource::new(),
        CollectingSink::new(),
        Box::new(NullStore),
        rx,
    )
    .unwrap();
    let second = LocalBuffer::for_config(&config);
    assert!(matches!(second, Err(Error::BufferLocked(_))));
}

// =============================================================================
// Rebalancing
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_revocation_flushes_in_flight_batch() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path(), json!({}));
    let source = MemorySource::new();
    fill(&source, 0, 300);
    fill(&source, 1, 300);
    source.revoke_after(400, vec![0]);
    let sink = CollectingSink::new();

    let summary = run(
        &config,
        source.clone(),
        sink.clone(),
        Box::new(NullStore),
        CheckpointState::new(),
    )
    .await
    .unwrap();

    let sizes: Vec<usize> = sink.batches().iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![400, 200]);
    assert_eq!(summary.records_emitted, 600);

    // The revoked partition was committed to the group before release.
    assert_eq!(source.commits()[0], PartitionOffsets::from([(0, 199)]));

    let positions = sink.positions();
    let unique: BTreeSet<_> = positions.iter().collect();
    assert_eq!(unique.len(), positions.len());
    assert_eq!(
        source.committed_offsets(),
        PartitionOffsets::from([(0, 299), (1, 299)])
    );
}

#[tokio::test(start_paused = true)]
async fn test_reassigned_partition_resumes_after_checkpoint() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path(), json!({}));

    // The group lags behind the checkpoint: redelivered offsets are dropped.
    let source = MemorySource::new().with_committed(PartitionOffsets::from([(0, 4)]));
    fill(&source, 0, 20);
    let sink = CollectingSink::new();

    let mut initial = CheckpointState::new();
    initial
        .advance(
            common::STREAM,
            common::STREAM,
            "tap-group",
            &PartitionOffsets::from([(0, 9)]),
        )
        .unwrap();

    run(&config, source, sink.clone(), Box::new(NullStore), initial)
        .await
        .unwrap();

    let expected: Vec<(i32, i64)> = (10..20).map(|o| (0, o)).collect();
    assert_eq!(sink.positions(), expected);
}
