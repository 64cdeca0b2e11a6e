use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use checkpoint::PartitionOffsets;
use kafka_types::{Offset, Partition, RawRecord};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::{ClientContext, TopicPartitionList};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{MessageSource, PollEvent, RebalanceEvent};
use crate::config::TopicConfig;
use crate::error::{ConnectionError, Result};

/// Upper bound of one librdkafka poll on the fetch thread
const FETCH_POLL_INTERVAL: Duration = Duration::from_millis(100);
const SEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// librdkafka settings for the tap's consumer.
///
/// Offsets are committed manually, and only after the records they cover
/// were emitted and checkpointed.
pub fn client_config(config: &TopicConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", config.bootstrap_servers.join(","))
        .set("group.id", &config.group_id)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("auto.offset.reset", "earliest")
        .set("enable.partition.eof", "false")
        .set(
            "session.timeout.ms",
            config.session_timeout.as_millis().to_string(),
        )
        .set(
            "heartbeat.interval.ms",
            config.heartbeat_interval.as_millis().to_string(),
        )
        .set(
            "max.poll.interval.ms",
            config.max_poll_interval.as_millis().to_string(),
        )
        .set("security.protocol", config.security_protocol.to_lowercase());
    client_config
}

fn verify_topic<C: Consumer<X>, X: ConsumerContext + 'static>(
    consumer: &C,
    config: &TopicConfig,
) -> std::result::Result<(), ConnectionError> {
    let metadata = consumer
        .fetch_metadata(Some(config.topic.as_str()), config.consumer_timeout)
        .map_err(|source| {
            warn!(
                "Unable to connect to kafka. bootstrap_servers: {:?}, topic: {}, group_id: {}",
                config.bootstrap_servers, config.topic, config.group_id
            );
            ConnectionError::Client {
                bootstrap_servers: config.bootstrap_servers.join(","),
                source,
            }
        })?;

    let visible = metadata.topics().iter().any(|topic| {
        topic.name() == config.topic && topic.error().is_none() && !topic.partitions().is_empty()
    });
    if !visible {
        warn!(
            "Unable to view topic {}. bootstrap_servers: {:?}, topic: {}, group_id: {}",
            config.topic, config.bootstrap_servers, config.topic, config.group_id
        );
        return Err(ConnectionError::TopicNotVisible {
            topic: config.topic.clone(),
        });
    }
    Ok(())
}

/// Connectivity and topic visibility check used by discovery.
///
/// Blocks for up to `consumer_timeout`.
pub fn check_topic(config: &TopicConfig) -> std::result::Result<(), ConnectionError> {
    let consumer: BaseConsumer = client_config(config).create().map_err(|source| {
        ConnectionError::Client {
            bootstrap_servers: config.bootstrap_servers.join(","),
            source,
        }
    })?;
    verify_topic(&consumer, config)
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<Partition> {
    let mut partitions: Vec<Partition> = tpl.elements().iter().map(|e| e.partition()).collect();
    partitions.sort_unstable();
    partitions
}

/// Output of the fetch thread, in the order librdkafka produced it.
enum Fetched {
    Record(RawRecord),
    Assigned(Vec<Partition>),
    /// The fetch thread is parked in the revoke callback until `release` is
    /// answered or the wait times out.
    Revoked {
        partitions: Vec<Partition>,
        release: std_mpsc::SyncSender<()>,
    },
}

/// Forwards librdkafka rebalance callbacks into the consume loop.
struct RebalanceContext {
    fetched: mpsc::Sender<Fetched>,
    /// Longest time a revocation waits for the consume loop
    release_timeout: Duration,
}

impl RebalanceContext {
    fn send(&self, fetched: Fetched) -> bool {
        // Closing the consumer on drop runs callbacks on the caller's thread,
        // where blocking is not allowed. The channel is closed by then.
        if self.fetched.is_closed() || self.fetched.blocking_send(fetched).is_err() {
            debug!("Rebalance event dropped: source already closed");
            return false;
        }
        true
    }

    /// Hand revoked partitions to the consume loop and wait until it has
    /// flushed and committed them.
    fn revoke_and_wait(&self, partitions: Vec<Partition>) {
        let (release, released) = std_mpsc::sync_channel(1);
        info!("Partitions revoked: {partitions:?}");
        if !self.send(Fetched::Revoked {
            partitions: partitions.clone(),
            release,
        }) {
            return;
        }

        match released.recv_timeout(self.release_timeout) {
            Ok(()) => debug!("Partitions {partitions:?} released"),
            Err(RecvTimeoutError::Timeout) => warn!(
                "Partitions {partitions:?} not released within {:?}, giving them up",
                self.release_timeout
            ),
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Source closed while partitions {partitions:?} were revoked")
            }
        }
    }
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            let partitions = partitions_of(tpl);
            if !partitions.is_empty() {
                self.revoke_and_wait(partitions);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let partitions = partitions_of(tpl);
                if !partitions.is_empty() {
                    info!("Partitions assigned: {partitions:?}");
                    self.send(Fetched::Assigned(partitions));
                }
            }
            Rebalance::Error(e) => warn!("Rebalance error: {e}"),
            Rebalance::Revoke(_) => {}
        }
    }
}

fn raw_record(msg: &BorrowedMessage<'_>) -> RawRecord {
    RawRecord {
        partition: msg.partition(),
        offset: msg.offset(),
        key: msg.key().map(<[u8]>::to_vec),
        value: msg.payload().map(<[u8]>::to_vec),
        timestamp: msg.timestamp().to_millis(),
    }
}

/// Polls librdkafka on its own thread so rebalance callbacks can block
/// while the consume loop commits.
fn fetch_loop(
    consumer: Arc<BaseConsumer<RebalanceContext>>,
    fetched: mpsc::Sender<Fetched>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        match consumer.poll(FETCH_POLL_INTERVAL) {
            None => {}
            Some(Ok(msg)) => {
                if fetched.blocking_send(Fetched::Record(raw_record(&msg))).is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                warn!("Error receiving message: {e}");
                std::thread::sleep(FETCH_POLL_INTERVAL);
            }
        }
    }
    debug!("Kafka fetch thread stopped");
}

/// Kafka consumer group member subscribed to one topic.
pub struct KafkaSource {
    consumer: Arc<BaseConsumer<RebalanceContext>>,
    fetched: mpsc::Receiver<Fetched>,
    /// Fetched ahead of a poll that already had records
    deferred: Option<Fetched>,
    /// Answer to the revoke callback currently waiting on `release`
    pending_release: Option<std_mpsc::SyncSender<()>>,
    topic: String,
    /// Seek targets not yet confirmed by a fetched message
    pending_seeks: HashMap<Partition, Offset>,
    stop: Arc<AtomicBool>,
    fetcher: Option<JoinHandle<()>>,
}

impl KafkaSource {
    /// Create the consumer, check the topic is visible, subscribe and start
    /// fetching.
    pub fn connect(config: &TopicConfig) -> std::result::Result<Self, ConnectionError> {
        let (tx, rx) = mpsc::channel(config.max_poll_records);
        let context = RebalanceContext {
            fetched: tx.clone(),
            release_timeout: config.max_poll_interval,
        };
        let consumer: BaseConsumer<RebalanceContext> = client_config(config)
            .create_with_context(context)
            .map_err(|source| ConnectionError::Client {
                bootstrap_servers: config.bootstrap_servers.join(","),
                source,
            })?;

        verify_topic(&consumer, config)?;
        consumer.subscribe(&[config.topic.as_str()])?;

        info!(
            "Subscribed to topic {} as group {}",
            config.topic, config.group_id
        );

        let consumer = Arc::new(consumer);
        let stop = Arc::new(AtomicBool::new(false));
        let fetcher = std::thread::Builder::new()
            .name("kafka-fetch".to_string())
            .spawn({
                let consumer = Arc::clone(&consumer);
                let stop = Arc::clone(&stop);
                move || fetch_loop(consumer, tx, stop)
            })
            .map_err(|_| ConnectionError::Closed)?;

        Ok(Self {
            consumer,
            fetched: rx,
            deferred: None,
            pending_release: None,
            topic: config.topic.clone(),
            pending_seeks: HashMap::new(),
            stop,
            fetcher: Some(fetcher),
        })
    }

    fn try_seek(&self, partition: Partition, next_offset: Offset) -> bool {
        match self.consumer.seek(
            &self.topic,
            partition,
            rdkafka::Offset::Offset(next_offset),
            SEEK_TIMEOUT,
        ) {
            Ok(()) => true,
            Err(e) => {
                debug!("Seek of partition {partition} to {next_offset} deferred: {e}");
                false
            }
        }
    }

    /// Check a fetched message against an outstanding seek. Messages fetched
    /// from a position other than the seek target are dropped.
    fn accept(&mut self, raw: RawRecord) -> Option<RawRecord> {
        let Some(&target) = self.pending_seeks.get(&raw.partition) else {
            return Some(raw);
        };
        if raw.offset == target {
            self.pending_seeks.remove(&raw.partition);
            return Some(raw);
        }

        let seeked = self.try_seek(raw.partition, target);
        if seeked {
            self.pending_seeks.remove(&raw.partition);
            return None;
        }
        if raw.offset < target {
            return None;
        }
        warn!(
            "Partition {} delivered offset {} past seek target {}",
            raw.partition, raw.offset, target
        );
        self.pending_seeks.remove(&raw.partition);
        Some(raw)
    }

    fn rebalance_event(&mut self, fetched: Fetched) -> Option<RebalanceEvent> {
        match fetched {
            Fetched::Record(_) => None,
            Fetched::Assigned(partitions) => Some(RebalanceEvent::Assigned(partitions)),
            Fetched::Revoked {
                partitions,
                release,
            } => {
                self.pending_release = Some(release);
                Some(RebalanceEvent::Revoked(partitions))
            }
        }
    }
}

impl Drop for KafkaSource {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.pending_release = None;
        self.fetched.close();
        if let Some(fetcher) = self.fetcher.take() {
            if fetcher.join().is_err() {
                warn!("Kafka fetch thread panicked");
            }
        }
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn poll(&mut self, max_records: usize, timeout: Duration) -> Result<PollEvent> {
        if let Some(fetched) = self.deferred.take() {
            if let Some(event) = self.rebalance_event(fetched) {
                return Ok(PollEvent::Rebalance(event));
            }
        }

        let deadline = Instant::now() + timeout;
        let mut records = Vec::new();

        // Wait for the first message, then take only what is already queued.
        while records.len() < max_records {
            let next = if records.is_empty() {
                match tokio::time::timeout_at(deadline, self.fetched.recv()).await {
                    Ok(next) => next,
                    Err(_) => break,
                }
            } else {
                match self.fetched.try_recv() {
                    Ok(next) => Some(next),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => None,
                }
            };

            match next {
                Some(Fetched::Record(raw)) => {
                    if let Some(raw) = self.accept(raw) {
                        records.push(raw);
                    }
                }
                Some(rebalance) if records.is_empty() => {
                    if let Some(event) = self.rebalance_event(rebalance) {
                        return Ok(PollEvent::Rebalance(event));
                    }
                }
                Some(rebalance) => {
                    self.deferred = Some(rebalance);
                    break;
                }
                None if records.is_empty() => return Err(ConnectionError::Closed.into()),
                None => break,
            }
        }

        if records.is_empty() {
            Ok(PollEvent::Idle)
        } else {
            Ok(PollEvent::Records(records))
        }
    }

    async fn seek(&mut self, partition: Partition, next_offset: Offset) -> Result<()> {
        debug!("Seeking partition {partition} to offset {next_offset}");
        self.try_seek(partition, next_offset);
        self.pending_seeks.insert(partition, next_offset);
        Ok(())
    }

    async fn commit(&mut self, offsets: &PartitionOffsets) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }

        let mut tpl = TopicPartitionList::new();
        for (&partition, &offset) in offsets {
            tpl.add_partition_offset(&self.topic, partition, rdkafka::Offset::Offset(offset + 1))
                .map_err(ConnectionError::from)?;
        }

        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(ConnectionError::from)?;
        debug!("Committed offsets to consumer group: {offsets:?}");
        Ok(())
    }

    async fn release(&mut self, partitions: &[Partition]) -> Result<()> {
        for partition in partitions {
            self.pending_seeks.remove(partition);
        }
        if let Some(release) = self.pending_release.take() {
            // The callback may already have timed out.
            let _ = release.send(());
        }
        Ok(())
    }

    fn assignment(&self) -> Vec<Partition> {
        match self.consumer.assignment() {
            Ok(tpl) => partitions_of(&tpl),
            Err(e) => {
                warn!("Unable to read partition assignment: {e}");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_config() {
        let mut raw = json!({
            "bootstrap_servers": "a:9092,b:9092",
            "group_id": "tap-group",
            "topic": "orders",
            "session_timeout_ms": 45000,
            "security_protocol": "PLAINTEXT"
        });
        raw["heartbeat_interval_ms"] = json!("3000");
        let config = TopicConfig::from_raw(raw).unwrap();

        let client_config = client_config(&config);
        assert_eq!(client_config.get("bootstrap.servers"), Some("a:9092,b:9092"));
        assert_eq!(client_config.get("group.id"), Some("tap-group"));
        assert_eq!(client_config.get("enable.auto.commit"), Some("false"));
        assert_eq!(client_config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(client_config.get("session.timeout.ms"), Some("45000"));
        assert_eq!(client_config.get("heartbeat.interval.ms"), Some("3000"));
        assert_eq!(client_config.get("max.poll.interval.ms"), Some("300000"));
        assert_eq!(client_config.get("security.protocol"), Some("plaintext"));
    }

    fn context(release_timeout: Duration) -> (RebalanceContext, mpsc::Receiver<Fetched>) {
        let (tx, rx) = mpsc::channel(4);
        (
            RebalanceContext {
                fetched: tx,
                release_timeout,
            },
            rx,
        )
    }

    #[test]
    fn test_revoke_waits_for_release() {
        let (context, mut rx) = context(Duration::from_secs(30));
        let done = Arc::new(AtomicBool::new(false));
        let callback = std::thread::spawn({
            let done = Arc::clone(&done);
            move || {
                context.revoke_and_wait(vec![1, 2]);
                done.store(true, Ordering::SeqCst);
            }
        });

        let Some(Fetched::Revoked {
            partitions,
            release,
        }) = rx.blocking_recv()
        else {
            panic!("expected a revocation");
        };
        assert_eq!(partitions, vec![1, 2]);

        std::thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));

        release.send(()).unwrap();
        callback.join().unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_revoke_gives_up_after_timeout() {
        let (context, mut rx) = context(Duration::from_millis(20));
        let callback = std::thread::spawn(move || context.revoke_and_wait(vec![0]));

        // Hold the release handle without answering.
        let _pending = rx.blocking_recv();
        callback.join().unwrap();
    }

    #[test]
    fn test_revoke_returns_when_source_is_closed() {
        let (context, rx) = context(Duration::from_secs(30));
        drop(rx);
        context.revoke_and_wait(vec![0]);
    }
}
