#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Result};
use async_trait::async_trait;
use checkpoint::{CheckpointState, PartitionOffsets};
use kafka_types::{generate_catalog, CatalogEntry, Offset, Partition};
use serde_json::{json, Value};
use tap_kafka_source::{Batch, OutputSink, TopicConfig};
use tokio::time::Instant;

pub const STREAM: &str = "orders";

#[derive(Debug, Clone)]
pub enum Output {
    Schema(String),
    Records {
        at: Instant,
        records: Vec<Value>,
    },
    State(CheckpointState),
}

#[derive(Debug, Default)]
struct Inner {
    outputs: Vec<Output>,
    failures_left: u32,
    failing_after: Option<usize>,
    batch_calls: usize,
}

/// Sink keeping everything in memory. Clones share the output.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    inner: Arc<Mutex<Inner>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Fail the next `n` batch emissions.
    pub fn fail_next(&self, n: u32) {
        self.lock().failures_left = n;
    }

    /// Fail every batch emission after the first `n` successful ones.
    pub fn fail_after(&self, n: usize) {
        self.lock().failing_after = Some(n);
    }

    pub fn outputs(&self) -> Vec<Output> {
        self.lock().outputs.clone()
    }

    pub fn batches(&self) -> Vec<Vec<Value>> {
        self.outputs()
            .into_iter()
            .filter_map(|o| match o {
                Output::Records { records, .. } => Some(records),
                _ => None,
            })
            .collect()
    }

    pub fn records(&self) -> Vec<Value> {
        self.batches().into_iter().flatten().collect()
    }

    pub fn states(&self) -> Vec<PartitionOffsets> {
        self.outputs()
            .into_iter()
            .filter_map(|o| match o {
                Output::State(state) => Some(state.partition_offsets(STREAM)),
                _ => None,
            })
            .collect()
    }

    /// `(partition, offset)` of every emitted record, in emission order.
    pub fn positions(&self) -> Vec<(Partition, Offset)> {
        self.records().iter().map(position).collect()
    }
}

pub fn position(record: &Value) -> (Partition, Offset) {
    (
        record["message_partition"].as_i64().unwrap() as Partition,
        record["message_offset"].as_i64().unwrap(),
    )
}

#[async_trait]
impl OutputSink for CollectingSink {
    async fn emit_schema(&mut self, entry: &CatalogEntry) -> Result<()> {
        self.lock()
            .outputs
            .push(Output::Schema(entry.tap_stream_id.clone()));
        Ok(())
    }

    async fn emit_records(&mut self, _stream: &str, batch: &Batch) -> Result<()> {
        let mut inner = self.lock();
        if inner.failures_left > 0 {
            inner.failures_left -= 1;
            bail!("injected failure");
        }
        if inner.failing_after.is_some_and(|n| inner.batch_calls >= n) {
            bail!("sink is down");
        }
        inner.batch_calls += 1;
        inner.outputs.push(Output::Records {
            at: Instant::now(),
            records: batch
                .records()
                .iter()
                .map(|r| Value::Object(r.record.clone()))
                .collect(),
        });
        Ok(())
    }

    async fn emit_state(&mut self, state: &CheckpointState) -> Result<()> {
        self.lock().outputs.push(Output::State(state.clone()));
        Ok(())
    }
}

/// Test config with a local store under `dir`, overridden by `extra`.
pub fn config(dir: &Path, extra: Value) -> TopicConfig {
    let mut raw = json!({
        "bootstrap_servers": "localhost:9092",
        "group_id": "tap-group",
        "topic": STREAM,
        "local_store_dir": dir.join("local-store"),
        "emit_retry_backoff_ms": 100,
    });
    if let (Some(raw), Some(extra)) = (raw.as_object_mut(), extra.as_object()) {
        raw.extend(extra.clone());
    }
    TopicConfig::from_raw(raw).unwrap()
}

pub fn catalog_entry() -> CatalogEntry {
    generate_catalog(STREAM, &BTreeMap::new())
        .unwrap()
        .streams
        .remove(0)
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
