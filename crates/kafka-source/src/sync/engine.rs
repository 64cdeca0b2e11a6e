use std::time::Duration;

use checkpoint::{CheckpointState, PartitionOffsets, StateStore};
use kafka_types::{CatalogEntry, Partition, RawRecord};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{SyncPhase, SyncSummary, TerminationReason};
use crate::batch::{Batch, BatchAccumulator};
use crate::buffer::{LocalBuffer, LocalBufferEntry};
use crate::config::TopicConfig;
use crate::consumer::{MessageSource, PollEvent, RebalanceEvent};
use crate::decoder::MessageDecoder;
use crate::error::{EmissionError, Error, Result};
use crate::offsets::OffsetTracker;
use crate::record::RecordShaper;
use crate::sink::OutputSink;

#[derive(Debug, Default)]
struct Counters {
    batches: usize,
    records_emitted: usize,
    records_skipped: usize,
    records_replayed: usize,
}

/// Drives one stream from its Kafka topic to the output sink.
pub struct SyncEngine<'a, S: MessageSource, O: OutputSink> {
    config: &'a TopicConfig,
    entry: CatalogEntry,
    source: S,
    sink: O,
    store: Box<dyn StateStore>,
    shutdown: watch::Receiver<bool>,

    buffer: LocalBuffer,
    decoder: MessageDecoder,
    shaper: RecordShaper,
    tracker: OffsetTracker,
    accumulator: BatchAccumulator,
    state: CheckpointState,

    phase: SyncPhase,
    counters: Counters,
    started_at: Instant,
    last_record_at: Instant,
    last_source_commit: Instant,
    /// Offsets last committed to the consumer group
    source_committed: PartitionOffsets,
}

impl<'a, S: MessageSource, O: OutputSink> SyncEngine<'a, S, O> {
    /// Build the engine around an opened local store. The store's lock is
    /// expected to be held before `source` joins the consumer group.
    pub fn new(
        config: &'a TopicConfig,
        entry: CatalogEntry,
        buffer: LocalBuffer,
        source: S,
        sink: O,
        store: Box<dyn StateStore>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let decoder = MessageDecoder::from_config(config)?;
        let now = Instant::now();

        Ok(Self {
            config,
            entry,
            source,
            sink,
            store,
            shutdown,
            buffer,
            decoder,
            shaper: RecordShaper::new(config.primary_keys.clone()),
            tracker: OffsetTracker::new(),
            accumulator: BatchAccumulator::new(config.batch_size_rows, config.batch_flush_interval),
            state: CheckpointState::new(),
            phase: SyncPhase::Initializing,
            counters: Counters::default(),
            started_at: now,
            last_record_at: now,
            last_source_commit: now,
            source_committed: PartitionOffsets::new(),
        })
    }

    /// Run until max runtime, idleness or shutdown, starting from `initial`.
    pub async fn run(mut self, initial: CheckpointState) -> Result<SyncSummary> {
        self.initialize(initial).await?;
        let reason = self.consume().await?;
        self.terminate(reason).await
    }

    fn transition(&mut self, next: SyncPhase) {
        if self.phase != next {
            debug!("Sync phase {:?} -> {:?}", self.phase, next);
            self.phase = next;
        }
    }

    async fn initialize(&mut self, initial: CheckpointState) -> Result<()> {
        self.transition(SyncPhase::Initializing);
        let stream = self.entry.tap_stream_id.clone();

        self.emit_schema().await?;

        let committed = initial.partition_offsets(&stream);
        if !committed.is_empty() {
            info!("Resuming stream {stream} from offsets {committed:?}");
        }
        self.tracker = OffsetTracker::restore(&committed);
        self.state = initial;

        for (&partition, &offset) in &committed {
            self.buffer.purge_committed(partition, offset)?;
        }

        let pending = self.buffer.replay_pending()?;
        if !pending.is_empty() {
            info!(
                "Replaying {} message(s) from local store {}",
                pending.len(),
                self.buffer.dir().display()
            );
        }
        for entry in pending {
            let raw = entry.to_raw()?;
            if !self.tracker.record(raw.partition, raw.offset) {
                continue;
            }
            self.counters.records_replayed += 1;
            self.ingest(raw, false).await?;
        }

        let now = Instant::now();
        self.started_at = now;
        self.last_record_at = now;
        Ok(())
    }

    async fn consume(&mut self) -> Result<TerminationReason> {
        self.transition(SyncPhase::Consuming);

        loop {
            if let Some(reason) = self.termination_reason() {
                return Ok(reason);
            }

            let timeout = self.poll_timeout();
            match self
                .source
                .poll(self.config.max_poll_records, timeout)
                .await?
            {
                PollEvent::Records(records) => {
                    if !records.is_empty() {
                        self.last_record_at = Instant::now();
                    }
                    for raw in records {
                        if !self.tracker.record(raw.partition, raw.offset) {
                            debug!(
                                "Skipping redelivered message at partition {} offset {}",
                                raw.partition, raw.offset
                            );
                            continue;
                        }
                        self.ingest(raw, true).await?;
                    }
                }
                PollEvent::Rebalance(event) => self.rebalance(event).await?,
                PollEvent::Idle => {}
            }

            if self.accumulator.should_flush() {
                self.flush_and_commit().await?;
            }
            self.commit_source(false).await;
        }
    }

    async fn terminate(&mut self, reason: TerminationReason) -> Result<SyncSummary> {
        info!("Stopping sync of {}: {reason}", self.entry.tap_stream_id);
        self.flush_and_commit().await?;
        self.commit_source(true).await;
        self.transition(SyncPhase::Terminated);

        let summary = SyncSummary {
            batches: self.counters.batches,
            records_emitted: self.counters.records_emitted,
            records_skipped: self.counters.records_skipped,
            records_replayed: self.counters.records_replayed,
            reason,
        };
        info!(
            "Sync finished: {} batch(es), {} record(s) emitted, {} skipped, {} replayed",
            summary.batches, summary.records_emitted, summary.records_skipped, summary.records_replayed
        );
        Ok(summary)
    }

    fn termination_reason(&self) -> Option<TerminationReason> {
        if *self.shutdown.borrow() {
            return Some(TerminationReason::Shutdown);
        }
        if self.started_at.elapsed() >= self.config.max_runtime {
            return Some(TerminationReason::MaxRuntime);
        }
        if self.last_record_at.elapsed() >= self.config.consumer_timeout {
            return Some(TerminationReason::Idle);
        }
        None
    }

    fn poll_timeout(&self) -> Duration {
        let idle_left = self
            .config
            .consumer_timeout
            .saturating_sub(self.last_record_at.elapsed());
        let runtime_left = self
            .config
            .max_runtime
            .saturating_sub(self.started_at.elapsed());

        let mut timeout = idle_left.min(runtime_left);
        if let Some(due) = self.accumulator.time_until_due() {
            timeout = timeout.min(due);
        }
        timeout
    }

    /// Buffer, decode and batch one newly tracked message.
    async fn ingest(&mut self, raw: RawRecord, append: bool) -> Result<()> {
        if append {
            self.buffer.append(&LocalBufferEntry::from_raw(&raw))?;
        }

        let decoded = match self.decoder.decode(&raw).await {
            Ok(message) => self.shaper.shape(&raw, message),
            Err(e) => Err(e),
        };
        match decoded {
            Ok(record) => self.accumulator.add(record),
            Err(e) => {
                warn!(
                    "Skipping message at partition {} offset {}: {e}",
                    raw.partition, raw.offset
                );
                self.counters.records_skipped += 1;
            }
        }

        if self.accumulator.should_flush() {
            self.flush_and_commit().await?;
        }
        Ok(())
    }

    /// Emit the open batch, then checkpoint every consumed offset.
    async fn flush_and_commit(&mut self) -> Result<()> {
        let resume = self.phase;

        self.transition(SyncPhase::Flushing);
        if let Some(batch) = self.accumulator.flush() {
            self.emit_batch(&batch).await?;
            self.counters.batches += 1;
            self.counters.records_emitted += batch.len();
            debug!(
                "Emitted batch of {} record(s) covering {:?}",
                batch.len(),
                batch.partitions()
            );
        }

        self.transition(SyncPhase::Committing);
        self.commit_pending().await?;

        self.transition(resume);
        Ok(())
    }

    async fn commit_pending(&mut self) -> Result<()> {
        let mut committed = PartitionOffsets::new();
        for partition in self.tracker.pending_partitions() {
            if let Some(offset) = self.tracker.committable(partition) {
                self.tracker.commit(partition, offset)?;
                committed.insert(partition, offset);
            }
        }
        if committed.is_empty() {
            return Ok(());
        }

        self.state.advance(
            &self.entry.tap_stream_id,
            &self.config.topic,
            &self.config.group_id,
            &committed,
        )?;
        self.emit_state().await?;
        self.store
            .store_state(&self.state)
            .await
            .map_err(Error::StateStore)?;

        for (&partition, &offset) in &committed {
            self.buffer.purge_committed(partition, offset)?;
        }
        debug!("Checkpointed offsets {committed:?}");

        self.commit_source(false).await;
        Ok(())
    }

    /// Commit checkpointed offsets of assigned partitions to the consumer
    /// group, at most once per commit interval unless forced.
    async fn commit_source(&mut self, force: bool) {
        if !force && self.last_source_commit.elapsed() < self.config.commit_interval {
            return;
        }
        self.last_source_commit = Instant::now();

        let assigned = self.source.assignment();
        let offsets: PartitionOffsets = self
            .tracker
            .snapshot()
            .into_iter()
            .filter(|(p, o)| assigned.contains(p) && self.source_committed.get(p) != Some(o))
            .collect();
        self.commit_to_group(offsets).await;
    }

    async fn commit_to_group(&mut self, offsets: PartitionOffsets) {
        if offsets.is_empty() {
            return;
        }
        match self.source.commit(&offsets).await {
            Ok(()) => {
                debug!("Committed offsets {offsets:?} to group {}", self.config.group_id);
                self.source_committed.extend(offsets);
            }
            Err(e) => warn!("Failed to commit offsets to kafka: {e}"),
        }
    }

    async fn rebalance(&mut self, event: RebalanceEvent) -> Result<()> {
        self.transition(SyncPhase::Rebalancing);

        match event {
            RebalanceEvent::Revoked(partitions) => {
                info!("Partitions {partitions:?} revoked, flushing in-flight batch");
                self.flush_and_commit().await?;

                let offsets: PartitionOffsets = self
                    .tracker
                    .snapshot()
                    .into_iter()
                    .filter(|(p, o)| {
                        partitions.contains(p) && self.source_committed.get(p) != Some(o)
                    })
                    .collect();
                self.commit_to_group(offsets).await;

                self.tracker.release(&partitions);
                for partition in &partitions {
                    self.source_committed.remove(partition);
                }
                self.source.release(&partitions).await?;
            }
            RebalanceEvent::Assigned(partitions) => {
                self.seek_assigned(&partitions).await?;
            }
        }

        self.transition(SyncPhase::Consuming);
        Ok(())
    }

    async fn seek_assigned(&mut self, partitions: &[Partition]) -> Result<()> {
        for &partition in partitions {
            match self.tracker.resume_point(partition) {
                Some(next) => {
                    info!("Resuming partition {partition} at offset {next}");
                    self.source.seek(partition, next).await?;
                }
                None => debug!("Partition {partition} starts at the group position"),
            }
        }
        Ok(())
    }

    fn max_attempts(&self) -> u32 {
        self.config.max_emit_attempts.max(1)
    }

    /// Log a failed emission and wait before the next attempt. Returns the
    /// error once attempts are exhausted.
    async fn retry_or_fail(
        &self,
        what: String,
        attempt: u32,
        source: anyhow::Error,
    ) -> Result<()> {
        if attempt >= self.max_attempts() {
            return Err(EmissionError {
                what,
                attempts: attempt,
                source,
            }
            .into());
        }
        warn!(
            "Failed to emit {what} (attempt {attempt}/{}): {source:#}",
            self.max_attempts()
        );
        tokio::time::sleep(self.config.emit_retry_backoff).await;
        Ok(())
    }

    async fn emit_batch(&mut self, batch: &Batch) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.sink.emit_records(&self.entry.tap_stream_id, batch).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    self.retry_or_fail(format!("batch of {} records", batch.len()), attempt, e)
                        .await?
                }
            }
            attempt += 1;
        }
    }

    async fn emit_state(&mut self) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.sink.emit_state(&self.state).await {
                Ok(()) => return Ok(()),
                Err(e) => self.retry_or_fail("state".to_string(), attempt, e).await?,
            }
            attempt += 1;
        }
    }

    async fn emit_schema(&mut self) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.sink.emit_schema(&self.entry).await {
                Ok(()) => return Ok(()),
                Err(e) => self.retry_or_fail("schema".to_string(), attempt, e).await?,
            }
            attempt += 1;
        }
    }
}
