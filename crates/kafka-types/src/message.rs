//! Kafka message types.
//!
//! A [`RawRecord`] is what the source hands to the consume loop; it lives only
//! until the decoder has turned it into a [`DecodedRecord`], which the batch
//! accumulator owns until the batch is emitted.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::{Offset, Partition};

/// A consumed Kafka message before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// Kafka partition number
    pub partition: Partition,
    /// Kafka offset within the partition
    pub offset: Offset,
    /// Message key (if any)
    pub key: Option<Vec<u8>>,
    /// Message value; `None` for tombstones
    pub value: Option<Vec<u8>>,
    /// Message timestamp in milliseconds since epoch (if available)
    pub timestamp: Option<i64>,
}

impl RawRecord {
    /// Create a record with a value and no key or timestamp.
    pub fn new(partition: Partition, offset: Offset, value: impl Into<Vec<u8>>) -> Self {
        Self {
            partition,
            offset,
            key: None,
            value: Some(value.into()),
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp = Some(timestamp_ms);
        self
    }

    /// Message timestamp as a UTC datetime.
    pub fn datetime(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }
}

/// A decoded message shaped into the record emitted downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    /// Partition the message was consumed from
    pub partition: Partition,
    /// Offset the message was consumed at
    pub offset: Offset,
    /// Message timestamp in milliseconds since epoch (if available)
    pub timestamp: Option<i64>,
    /// The record as it is emitted (message plus metadata columns)
    pub record: Map<String, Value>,
}

impl DecodedRecord {
    pub fn new(raw: &RawRecord, record: Map<String, Value>) -> Self {
        Self {
            partition: raw.partition,
            offset: raw.offset,
            timestamp: raw.timestamp,
            record,
        }
    }

    /// Look up a column of the shaped record.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.record.get(column)
    }
}
