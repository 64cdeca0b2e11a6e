//! Kafka consume loop for tap-kafka.
//!
//! This crate provides:
//! - A Kafka consumer group member with manual offset commits
//! - Plain text JSON and schema registry Avro decoding
//! - A disk-backed local store of consumed but not yet checkpointed messages
//! - The sync engine emitting Singer RECORD and STATE messages in batches
//!
//! # Delivery
//!
//! Every consumed message is appended to the local store before it is
//! decoded. A batch is emitted when it reaches `batch_size_rows` or has been
//! open for `batch_flush_interval_ms`. Only after the emission succeeded are
//! its offsets written to the Singer state and the state store. They are then
//! purged from the local store, and committed to the consumer group at most
//! once per `commit_interval_ms`. A crash at any point therefore replays
//! messages instead of losing them.

pub mod batch;
pub mod buffer;
pub mod config;
/// Message sources: the librdkafka consumer and an in-memory topic for tests
pub mod consumer;
pub mod decoder;
pub mod error;
pub mod offsets;
pub mod record;
pub mod sink;
pub mod sync;

pub use batch::{Batch, BatchAccumulator};
pub use buffer::{LocalBuffer, LocalBufferEntry};
pub use config::TopicConfig;
pub use consumer::{check_topic, KafkaSource, MessageSource, PollEvent, RebalanceEvent};
#[cfg(any(test, feature = "test-utils"))]
pub use consumer::MemorySource;
pub use decoder::{Encoding, MessageDecoder};
pub use error::{
    BufferLockedError, ConfigError, ConnectionError, DecodeError, EmissionError, Error,
    InvalidOffsetError, Result,
};
pub use offsets::OffsetTracker;
pub use record::RecordShaper;
pub use sink::{OutputSink, SingerSink};
pub use sync::{SyncEngine, SyncPhase, SyncSummary, TerminationReason};
