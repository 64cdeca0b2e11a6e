use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while turning raw config values into a `TopicConfig`.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config is missing required key: {0}")]
    MissingKey(&'static str),

    #[error("Invalid value for config key '{key}': {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("Config is not a valid JSON object: {0}")]
    Json(#[from] serde_json::Error),
}

/// The Kafka cluster cannot be used.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Unable to connect to kafka. bootstrap_servers: {bootstrap_servers}: {source}")]
    Client {
        bootstrap_servers: String,
        #[source]
        source: rdkafka::error::KafkaError,
    },

    #[error("Unable to view topic {topic}")]
    TopicNotVisible { topic: String },

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Cannot commit offsets of unassigned partitions {0:?}")]
    NotAssigned(Vec<i32>),

    #[error("Kafka consumer is closed")]
    Closed,
}

/// A message that cannot be turned into a record. The message is skipped.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Message is not valid {encoding}: {reason}")]
    Encoding {
        encoding: &'static str,
        reason: String,
    },

    #[error("Message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message has no payload")]
    MissingPayload,

    #[error("Message is not in schema registry wire format: {0}")]
    WireFormat(String),

    #[error("Cannot resolve schema {schema_id} from registry: {reason}")]
    Registry { schema_id: u32, reason: String },

    #[error("Schema registry {url} is unreachable: {reason}")]
    RegistryUnavailable { url: String, reason: String },

    #[error("Avro decoding failed: {0}")]
    Avro(String),

    #[error("Primary key column '{column}' not found at '{path}'")]
    MissingPrimaryKey { column: String, path: String },
}

/// An offset commit that would break the monotonic watermark.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidOffsetError {
    #[error(
        "Offset regression on partition {partition}: committed {committed}, attempted {attempted}"
    )]
    Regressed {
        partition: i32,
        committed: i64,
        attempted: i64,
    },

    #[error(
        "Offset {attempted} on partition {partition} was never consumed (committed: {committed:?})"
    )]
    NotContiguous {
        partition: i32,
        committed: Option<i64>,
        attempted: i64,
    },
}

#[derive(Error, Debug)]
#[error("Local store {} is locked by another process", .dir.display())]
pub struct BufferLockedError {
    pub dir: PathBuf,
}

#[derive(Error, Debug)]
#[error("Failed to emit {what} after {attempts} attempts: {source:#}")]
pub struct EmissionError {
    pub what: String,
    pub attempts: u32,
    #[source]
    pub source: anyhow::Error,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    InvalidOffset(#[from] InvalidOffsetError),

    #[error(transparent)]
    BufferLocked(#[from] BufferLockedError),

    #[error(transparent)]
    Emission(#[from] EmissionError),

    #[error("Local store I/O error: {0}")]
    Buffer(#[from] std::io::Error),

    #[error(transparent)]
    State(#[from] checkpoint::StateError),

    #[error("State store error: {0:#}")]
    StateStore(anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
