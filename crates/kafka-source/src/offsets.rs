//! Per-partition offset bookkeeping.
//!
//! The tracker knows two things per partition: the committed watermark (the
//! last offset whose record reached the sink and was checkpointed) and the
//! offsets consumed since. Kafka offsets are not dense (compaction and
//! transaction markers leave holes), so contiguity is defined by delivery
//! order: every recorded offset continues the chain started at the watermark.

use std::collections::{BTreeMap, BTreeSet};

use checkpoint::PartitionOffsets;
use kafka_types::{Offset, Partition};

use crate::error::InvalidOffsetError;

#[derive(Debug, Default, Clone)]
struct PartitionCursor {
    committed: Option<Offset>,
    recorded: BTreeSet<Offset>,
}

impl PartitionCursor {
    fn highest(&self) -> Option<Offset> {
        self.recorded.last().copied().max(self.committed)
    }
}

#[derive(Debug, Default, Clone)]
pub struct OffsetTracker {
    partitions: BTreeMap<Partition, PartitionCursor>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from previously checkpointed watermarks.
    pub fn restore(offsets: &PartitionOffsets) -> Self {
        let partitions = offsets
            .iter()
            .map(|(&partition, &offset)| {
                (
                    partition,
                    PartitionCursor {
                        committed: Some(offset),
                        recorded: BTreeSet::new(),
                    },
                )
            })
            .collect();
        Self { partitions }
    }

    /// Mark an offset as consumed.
    ///
    /// Returns `false` for redeliveries: offsets at or below the watermark or
    /// at or below the highest offset already recorded.
    pub fn record(&mut self, partition: Partition, offset: Offset) -> bool {
        let cursor = self.partitions.entry(partition).or_default();
        if cursor.highest().is_some_and(|highest| offset <= highest) {
            return false;
        }
        cursor.recorded.insert(offset);
        true
    }

    /// Highest consumed offset that is not committed yet.
    pub fn committable(&self, partition: Partition) -> Option<Offset> {
        self.partitions
            .get(&partition)
            .and_then(|cursor| cursor.recorded.last().copied())
    }

    pub fn committed(&self, partition: Partition) -> Option<Offset> {
        self.partitions.get(&partition).and_then(|c| c.committed)
    }

    /// Advance the watermark of a partition to `offset`.
    ///
    /// Committing the current watermark again is a no-op.
    pub fn commit(&mut self, partition: Partition, offset: Offset) -> Result<(), InvalidOffsetError> {
        let Some(cursor) = self.partitions.get_mut(&partition) else {
            return Err(InvalidOffsetError::NotContiguous {
                partition,
                committed: None,
                attempted: offset,
            });
        };

        if let Some(committed) = cursor.committed {
            if offset < committed {
                return Err(InvalidOffsetError::Regressed {
                    partition,
                    committed,
                    attempted: offset,
                });
            }
            if offset == committed {
                return Ok(());
            }
        }

        if !cursor.recorded.contains(&offset) {
            return Err(InvalidOffsetError::NotContiguous {
                partition,
                committed: cursor.committed,
                attempted: offset,
            });
        }

        cursor.committed = Some(offset);
        cursor.recorded.retain(|&recorded| recorded > offset);
        Ok(())
    }

    /// Committed watermarks of every known partition.
    pub fn snapshot(&self) -> PartitionOffsets {
        self.partitions
            .iter()
            .filter_map(|(&partition, cursor)| cursor.committed.map(|o| (partition, o)))
            .collect()
    }

    /// Next offset to fetch for a partition, if anything is known about it.
    pub fn resume_point(&self, partition: Partition) -> Option<Offset> {
        self.partitions
            .get(&partition)
            .and_then(PartitionCursor::highest)
            .map(|offset| offset + 1)
    }

    /// Forget uncommitted progress of revoked partitions.
    pub fn release(&mut self, partitions: &[Partition]) {
        for partition in partitions {
            if let Some(cursor) = self.partitions.get_mut(partition) {
                cursor.recorded.clear();
            }
        }
    }

    /// Partitions holding consumed but uncommitted offsets.
    pub fn pending_partitions(&self) -> Vec<Partition> {
        self.partitions
            .iter()
            .filter(|(_, cursor)| !cursor.recorded.is_empty())
            .map(|(&partition, _)| partition)
            .collect()
    }
}
