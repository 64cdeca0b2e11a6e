//! Singer message output.

use std::io::Write;

use anyhow::{Context, Result};
use async_trait::async_trait;
use checkpoint::CheckpointState;
use chrono::Utc;
use kafka_types::CatalogEntry;
use serde_json::{json, Value};

use crate::batch::Batch;

/// Destination of the tap's output.
///
/// A failed call may be retried with the same arguments, so implementations
/// must not leave partial output they cannot repeat.
#[async_trait]
pub trait OutputSink: Send {
    async fn emit_schema(&mut self, entry: &CatalogEntry) -> Result<()>;

    /// Emit every record of a batch as one unit.
    async fn emit_records(&mut self, stream: &str, batch: &Batch) -> Result<()>;

    async fn emit_state(&mut self, state: &CheckpointState) -> Result<()>;
}

/// Writes Singer messages as JSON lines. Each call is serialized up front
/// and handed to the writer in a single `write_all`.
pub struct SingerSink<W: Write + Send> {
    out: W,
}

impl SingerSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> SingerSink<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_out(&mut self, lines: &[u8], what: &str) -> Result<()> {
        self.out
            .write_all(lines)
            .and_then(|()| self.out.flush())
            .with_context(|| format!("Failed to write {what}"))
    }
}

fn push_line(buf: &mut Vec<u8>, message: &Value) -> Result<()> {
    serde_json::to_writer(&mut *buf, message).context("Failed to serialize message")?;
    buf.push(b'\n');
    Ok(())
}

#[async_trait]
impl<W: Write + Send> OutputSink for SingerSink<W> {
    async fn emit_schema(&mut self, entry: &CatalogEntry) -> Result<()> {
        let mut buf = Vec::new();
        push_line(
            &mut buf,
            &json!({
                "type": "SCHEMA",
                "stream": entry.tap_stream_id,
                "schema": entry.schema,
                "key_properties": entry.key_properties,
            }),
        )?;
        self.write_out(&buf, "SCHEMA message")
    }

    async fn emit_records(&mut self, stream: &str, batch: &Batch) -> Result<()> {
        let time_extracted = Utc::now().to_rfc3339();
        let mut buf = Vec::new();
        for record in batch.records() {
            push_line(
                &mut buf,
                &json!({
                    "type": "RECORD",
                    "stream": stream,
                    "record": record.record,
                    "time_extracted": time_extracted,
                }),
            )?;
        }
        self.write_out(&buf, "RECORD messages")
    }

    async fn emit_state(&mut self, state: &CheckpointState) -> Result<()> {
        let mut buf = Vec::new();
        push_line(
            &mut buf,
            &json!({
                "type": "STATE",
                "value": state.to_value(),
            }),
        )?;
        self.write_out(&buf, "STATE message")
    }
}
