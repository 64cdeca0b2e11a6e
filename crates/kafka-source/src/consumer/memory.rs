use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use checkpoint::PartitionOffsets;
use kafka_types::{Offset, Partition, RawRecord};
use tracing::debug;

use super::{MessageSource, PollEvent, RebalanceEvent};
use crate::error::{ConnectionError, Result};

#[derive(Debug, Default)]
struct Inner {
    logs: BTreeMap<Partition, Vec<RawRecord>>,
    /// Next offset to fetch per assigned partition
    positions: BTreeMap<Partition, Offset>,
    /// Last processed offset per partition, as committed by the group
    group_committed: PartitionOffsets,
    assigned: Vec<Partition>,
    started: bool,
    events: VecDeque<RebalanceEvent>,
    scheduled_revoke: Option<(usize, Vec<Partition>)>,
    delivered: usize,
    commits: Vec<PartitionOffsets>,
}

impl Inner {
    fn assign(&mut self, partitions: &[Partition]) {
        for &partition in partitions {
            let next = self
                .group_committed
                .get(&partition)
                .map(|offset| offset + 1)
                .unwrap_or(0);
            self.positions.insert(partition, next);
            if !self.assigned.contains(&partition) {
                self.assigned.push(partition);
            }
        }
        self.assigned.sort_unstable();
    }

    fn next_record(&mut self, partition: Partition) -> Option<RawRecord> {
        let position = *self.positions.get(&partition)?;
        let record = self
            .logs
            .get(&partition)?
            .iter()
            .find(|record| record.offset >= position)?
            .clone();
        self.positions.insert(partition, record.offset + 1);
        Some(record)
    }
}

/// In-process topic with consumer group semantics.
///
/// Handles are cheap clones over shared state, so a test can keep one to
/// inspect commits while the engine owns another. Every partition with data
/// is assigned on the first poll and fetching starts after the offsets the
/// group committed. Revoked partitions stay owned until released, and
/// commits for partitions not owned are rejected.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    inner: Arc<Mutex<Inner>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with offsets already committed for the group.
    pub fn with_committed(self, offsets: PartitionOffsets) -> Self {
        self.lock().group_committed = offsets;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a message with the next dense offset of the partition.
    pub fn push(&self, partition: Partition, value: impl Into<Vec<u8>>) -> Offset {
        let mut inner = self.lock();
        let log = inner.logs.entry(partition).or_default();
        let offset = log.last().map(|r| r.offset + 1).unwrap_or(0);
        log.push(RawRecord::new(partition, offset, value));
        offset
    }

    /// Append a prepared message. Offsets must increase within a partition.
    pub fn push_record(&self, record: RawRecord) {
        let mut inner = self.lock();
        let log = inner.logs.entry(record.partition).or_default();
        debug_assert!(log.last().map_or(true, |last| last.offset < record.offset));
        log.push(record);
    }

    /// Revoke `partitions` once `delivered` messages have been handed out.
    /// They are assigned again on the following poll.
    pub fn revoke_after(&self, delivered: usize, partitions: Vec<Partition>) {
        self.lock().scheduled_revoke = Some((delivered, partitions));
    }

    /// Offsets committed to the group so far.
    pub fn committed_offsets(&self) -> PartitionOffsets {
        self.lock().group_committed.clone()
    }

    /// Every commit request, in order.
    pub fn commits(&self) -> Vec<PartitionOffsets> {
        self.lock().commits.clone()
    }

    pub fn delivered(&self) -> usize {
        self.lock().delivered
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn poll(&mut self, max_records: usize, timeout: Duration) -> Result<PollEvent> {
        {
            let mut inner = self.lock();

            if !inner.started {
                inner.started = true;
                let partitions: Vec<Partition> = inner.logs.keys().copied().collect();
                inner.assign(&partitions);
                return Ok(PollEvent::Rebalance(RebalanceEvent::Assigned(partitions)));
            }

            if let Some(event) = inner.events.pop_front() {
                if let RebalanceEvent::Assigned(partitions) = &event {
                    inner.assign(partitions);
                }
                return Ok(PollEvent::Rebalance(event));
            }

            let mut limit = max_records;
            let threshold = inner.scheduled_revoke.as_ref().map(|(t, _)| *t);
            if let Some(threshold) = threshold {
                if inner.delivered >= threshold {
                    if let Some((_, partitions)) = inner.scheduled_revoke.take() {
                        inner
                            .events
                            .push_back(RebalanceEvent::Assigned(partitions.clone()));
                        return Ok(PollEvent::Rebalance(RebalanceEvent::Revoked(partitions)));
                    }
                }
                limit = limit.min(threshold.saturating_sub(inner.delivered));
            }

            let mut records = Vec::new();
            let assigned = inner.assigned.clone();
            'fill: loop {
                let before = records.len();
                for &partition in &assigned {
                    if records.len() >= limit {
                        break 'fill;
                    }
                    if let Some(record) = inner.next_record(partition) {
                        records.push(record);
                    }
                }
                if records.len() == before {
                    break;
                }
            }

            if !records.is_empty() {
                inner.delivered += records.len();
                return Ok(PollEvent::Records(records));
            }
        }

        tokio::time::sleep(timeout).await;
        Ok(PollEvent::Idle)
    }

    async fn seek(&mut self, partition: Partition, next_offset: Offset) -> Result<()> {
        let mut inner = self.lock();
        if inner.assigned.contains(&partition) {
            inner.positions.insert(partition, next_offset);
        }
        Ok(())
    }

    async fn commit(&mut self, offsets: &PartitionOffsets) -> Result<()> {
        debug!("Committing offsets to memory group: {offsets:?}");
        let mut inner = self.lock();
        let unowned: Vec<Partition> = offsets
            .keys()
            .filter(|p| !inner.assigned.contains(p))
            .copied()
            .collect();
        if !unowned.is_empty() {
            return Err(ConnectionError::NotAssigned(unowned).into());
        }
        inner
            .group_committed
            .extend(offsets.iter().map(|(&p, &o)| (p, o)));
        inner.commits.push(offsets.clone());
        Ok(())
    }

    async fn release(&mut self, partitions: &[Partition]) -> Result<()> {
        let mut inner = self.lock();
        inner.assigned.retain(|p| !partitions.contains(p));
        for partition in partitions {
            inner.positions.remove(partition);
        }
        Ok(())
    }

    fn assignment(&self) -> Vec<Partition> {
        self.lock().assigned.clone()
    }
}
