//! Size- and time-bounded batching of decoded records.

use std::collections::BTreeMap;
use std::time::Duration;

use kafka_types::{DecodedRecord, Offset, Partition};
use tokio::time::Instant;

/// A closed batch, emitted downstream as one unit.
#[derive(Debug, Clone)]
pub struct Batch {
    records: Vec<DecodedRecord>,
}

impl Batch {
    pub fn records(&self) -> &[DecodedRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Highest offset of every partition present in the batch.
    pub fn partitions(&self) -> BTreeMap<Partition, Offset> {
        let mut partitions = BTreeMap::new();
        for record in &self.records {
            let offset = partitions.entry(record.partition).or_insert(record.offset);
            *offset = (*offset).max(record.offset);
        }
        partitions
    }
}

/// Collects records until the row or the time bound is reached.
///
/// The time bound is measured from the first record of the open batch.
#[derive(Debug)]
pub struct BatchAccumulator {
    max_rows: usize,
    flush_interval: Duration,
    records: Vec<DecodedRecord>,
    opened_at: Option<Instant>,
}

impl BatchAccumulator {
    pub fn new(max_rows: usize, flush_interval: Duration) -> Self {
        Self {
            max_rows,
            flush_interval,
            records: Vec::with_capacity(max_rows.min(10_000)),
            opened_at: None,
        }
    }

    pub fn add(&mut self, record: DecodedRecord) {
        if self.records.is_empty() {
            self.opened_at = Some(Instant::now());
        }
        self.records.push(record);
    }

    pub fn should_flush(&self) -> bool {
        if self.records.is_empty() {
            return false;
        }
        self.records.len() >= self.max_rows
            || self
                .opened_at
                .is_some_and(|opened| opened.elapsed() >= self.flush_interval)
    }

    /// Time left before the open batch hits its time bound.
    pub fn time_until_due(&self) -> Option<Duration> {
        self.opened_at
            .map(|opened| self.flush_interval.saturating_sub(opened.elapsed()))
    }

    /// Close the open batch. `None` when nothing was added since the last flush.
    pub fn flush(&mut self) -> Option<Batch> {
        if self.records.is_empty() {
            return None;
        }
        self.opened_at = None;
        Some(Batch {
            records: std::mem::take(&mut self.records),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
