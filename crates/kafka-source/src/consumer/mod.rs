//! Message sources. The in-memory topic is only built for tests or with the
//! `test-utils` feature.
//!
//! The consume loop talks to Kafka through [`MessageSource`]. Rebalances are
//! reported as ordinary poll events. A revocation holds the partitions until
//! the loop has flushed, committed and called [`MessageSource::release`].

mod kafka;
#[cfg(any(test, feature = "test-utils"))]
mod memory;

use std::time::Duration;

use async_trait::async_trait;
use checkpoint::PartitionOffsets;
use kafka_types::{Offset, Partition, RawRecord};

use crate::error::Result;

pub use kafka::{check_topic, client_config, KafkaSource};
#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemorySource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    Assigned(Vec<Partition>),
    Revoked(Vec<Partition>),
}

#[derive(Debug)]
pub enum PollEvent {
    Records(Vec<RawRecord>),
    Rebalance(RebalanceEvent),
    /// Nothing arrived before the timeout
    Idle,
}

#[async_trait]
pub trait MessageSource: Send {
    /// Wait at most `timeout` for up to `max_records` messages or a
    /// rebalance notification.
    async fn poll(&mut self, max_records: usize, timeout: Duration) -> Result<PollEvent>;

    /// Position `partition` so the next message fetched is `next_offset`.
    async fn seek(&mut self, partition: Partition, next_offset: Offset) -> Result<()>;

    /// Commit the given last-processed offsets to the consumer group.
    async fn commit(&mut self, offsets: &PartitionOffsets) -> Result<()>;

    /// Let go of revoked partitions. Until then they stay owned, so their
    /// offsets can still be committed.
    async fn release(&mut self, partitions: &[Partition]) -> Result<()>;

    /// Partitions currently assigned to this consumer.
    fn assignment(&self) -> Vec<Partition>;
}
