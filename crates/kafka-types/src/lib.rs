//! Shared types for tap-kafka.
//!
//! This crate holds the types that both the consume loop and the CLI need
//! without pulling in a Kafka client:
//!
//! - [`message`] - raw consumed messages and decoded records
//! - [`catalog`] - Singer catalog entries describing the emitted stream
//! - [`error`] - Error types for catalog handling
//!
//! # Record Flow
//!
//! ```text
//! Kafka message → RawRecord → (decoder) → serde_json::Value → DecodedRecord → Singer RECORD
//! ```

pub mod catalog;
pub mod error;
pub mod message;

// Re-export main types for convenient access
pub use catalog::{generate_catalog, stream_name_for_topic, Catalog, CatalogEntry, MetadataEntry};
pub use error::{KafkaTypesError, Result};
pub use message::{DecodedRecord, RawRecord};

/// Partition number, as reported by librdkafka.
pub type Partition = i32;

/// Offset within a partition, as reported by librdkafka.
pub type Offset = i64;
