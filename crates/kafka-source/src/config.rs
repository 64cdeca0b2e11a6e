//! Run configuration.
//!
//! A [`TopicConfig`] is built once from the orchestrator's config file and
//! handed by reference to every component. Numeric tunables accept either
//! JSON numbers or numeric strings.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::decoder::Encoding;
use crate::error::ConfigError;

pub const DEFAULT_MAX_RUNTIME_MS: u64 = 300_000;
pub const DEFAULT_COMMIT_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_BATCH_SIZE_ROWS: usize = 1_000;
pub const DEFAULT_BATCH_FLUSH_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_CONSUMER_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_MAX_POLL_INTERVAL_MS: u64 = 300_000;
pub const DEFAULT_MAX_POLL_RECORDS: usize = 500;
pub const DEFAULT_ENCODING: &str = "utf-8";
pub const DEFAULT_LOCAL_STORE_DIR: &str = "tap-kafka-local-store";
pub const DEFAULT_LOCAL_STORE_BATCH_SIZE_ROWS: usize = 1_000;
pub const DEFAULT_SECURITY_PROTOCOL: &str = "SSL";
pub const DEFAULT_MAX_EMIT_ATTEMPTS: u32 = 3;
pub const DEFAULT_EMIT_RETRY_BACKOFF_MS: u64 = 1_000;

/// Immutable configuration of one tap run.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicConfig {
    pub bootstrap_servers: Vec<String>,
    pub group_id: String,
    pub topic: String,
    /// Output column name to JSON pointer into the decoded message
    pub primary_keys: BTreeMap<String, String>,
    pub max_runtime: Duration,
    /// Minimum time between offset commits to the consumer group
    pub commit_interval: Duration,
    pub batch_size_rows: usize,
    pub batch_flush_interval: Duration,
    /// Idle time after which the run ends
    pub consumer_timeout: Duration,
    pub session_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_poll_interval: Duration,
    pub max_poll_records: usize,
    pub encoding: Encoding,
    pub local_store_dir: PathBuf,
    /// Rows per local store segment file
    pub local_store_batch_size_rows: usize,
    /// Schema registry URL; `None` means plain JSON messages
    pub avro_schema: Option<String>,
    pub security_protocol: String,
    pub max_emit_attempts: u32,
    pub emit_retry_backoff: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Numeric {
    Number(u64),
    Text(String),
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    bootstrap_servers: Option<String>,
    group_id: Option<String>,
    topic: Option<String>,
    #[serde(default)]
    primary_keys: BTreeMap<String, String>,
    max_runtime_ms: Option<Numeric>,
    commit_interval_ms: Option<Numeric>,
    batch_size_rows: Option<Numeric>,
    batch_flush_interval_ms: Option<Numeric>,
    consumer_timeout_ms: Option<Numeric>,
    session_timeout_ms: Option<Numeric>,
    heartbeat_interval_ms: Option<Numeric>,
    max_poll_interval_ms: Option<Numeric>,
    max_poll_records: Option<Numeric>,
    encoding: Option<String>,
    local_store_dir: Option<PathBuf>,
    local_store_batch_size_rows: Option<Numeric>,
    avro_schema: Option<String>,
    security_protocol: Option<String>,
    max_emit_attempts: Option<Numeric>,
    emit_retry_backoff_ms: Option<Numeric>,
}

fn numeric(key: &'static str, value: Option<Numeric>, default: u64) -> Result<u64, ConfigError> {
    match value {
        None => Ok(default),
        Some(Numeric::Number(n)) => Ok(n),
        Some(Numeric::Text(s)) => s.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key,
            reason: format!("'{s}' is not a non-negative integer"),
        }),
    }
}

fn positive(key: &'static str, value: Option<Numeric>, default: u64) -> Result<u64, ConfigError> {
    let n = numeric(key, value, default)?;
    if n == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(n)
}

fn millis(key: &'static str, value: Option<Numeric>, default: u64) -> Result<Duration, ConfigError> {
    numeric(key, value, default).map(Duration::from_millis)
}

fn required(key: &'static str, value: Option<String>) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::MissingKey(key)),
    }
}

impl TopicConfig {
    /// Build the configuration from the raw config document, applying defaults.
    pub fn from_raw(raw: Value) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_value(raw)?;

        let bootstrap_servers: Vec<String> = required("bootstrap_servers", raw.bootstrap_servers)?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if bootstrap_servers.is_empty() {
            return Err(ConfigError::MissingKey("bootstrap_servers"));
        }

        for (column, path) in &raw.primary_keys {
            if !path.starts_with('/') {
                return Err(ConfigError::InvalidValue {
                    key: "primary_keys",
                    reason: format!("path '{path}' for column '{column}' must start with '/'"),
                });
            }
        }

        let encoding_name = raw.encoding.unwrap_or_else(|| DEFAULT_ENCODING.to_string());
        let encoding = Encoding::parse(&encoding_name).ok_or_else(|| ConfigError::InvalidValue {
            key: "encoding",
            reason: format!("unsupported encoding '{encoding_name}'"),
        })?;

        let local_store_dir = match raw.local_store_dir {
            Some(dir) => dir,
            None => std::env::current_dir()
                .map(|cwd| cwd.join(DEFAULT_LOCAL_STORE_DIR))
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOCAL_STORE_DIR)),
        };

        let max_emit_attempts = positive(
            "max_emit_attempts",
            raw.max_emit_attempts,
            DEFAULT_MAX_EMIT_ATTEMPTS as u64,
        )?;

        Ok(Self {
            bootstrap_servers,
            group_id: required("group_id", raw.group_id)?,
            topic: required("topic", raw.topic)?,
            primary_keys: raw.primary_keys,
            max_runtime: millis("max_runtime_ms", raw.max_runtime_ms, DEFAULT_MAX_RUNTIME_MS)?,
            commit_interval: millis(
                "commit_interval_ms",
                raw.commit_interval_ms,
                DEFAULT_COMMIT_INTERVAL_MS,
            )?,
            batch_size_rows: positive(
                "batch_size_rows",
                raw.batch_size_rows,
                DEFAULT_BATCH_SIZE_ROWS as u64,
            )? as usize,
            batch_flush_interval: millis(
                "batch_flush_interval_ms",
                raw.batch_flush_interval_ms,
                DEFAULT_BATCH_FLUSH_INTERVAL_MS,
            )?,
            consumer_timeout: millis(
                "consumer_timeout_ms",
                raw.consumer_timeout_ms,
                DEFAULT_CONSUMER_TIMEOUT_MS,
            )?,
            session_timeout: millis(
                "session_timeout_ms",
                raw.session_timeout_ms,
                DEFAULT_SESSION_TIMEOUT_MS,
            )?,
            heartbeat_interval: millis(
                "heartbeat_interval_ms",
                raw.heartbeat_interval_ms,
                DEFAULT_HEARTBEAT_INTERVAL_MS,
            )?,
            max_poll_interval: millis(
                "max_poll_interval_ms",
                raw.max_poll_interval_ms,
                DEFAULT_MAX_POLL_INTERVAL_MS,
            )?,
            max_poll_records: positive(
                "max_poll_records",
                raw.max_poll_records,
                DEFAULT_MAX_POLL_RECORDS as u64,
            )? as usize,
            encoding,
            local_store_dir,
            local_store_batch_size_rows: positive(
                "local_store_batch_size_rows",
                raw.local_store_batch_size_rows,
                DEFAULT_LOCAL_STORE_BATCH_SIZE_ROWS as u64,
            )? as usize,
            avro_schema: raw.avro_schema.filter(|url| !url.trim().is_empty()),
            security_protocol: raw
                .security_protocol
                .unwrap_or_else(|| DEFAULT_SECURITY_PROTOCOL.to_string()),
            max_emit_attempts: u32::try_from(max_emit_attempts).map_err(|_| {
                ConfigError::InvalidValue {
                    key: "max_emit_attempts",
                    reason: format!("{max_emit_attempts} is too large"),
                }
            })?,
            emit_retry_backoff: millis(
                "emit_retry_backoff_ms",
                raw.emit_retry_backoff_ms,
                DEFAULT_EMIT_RETRY_BACKOFF_MS,
            )?,
        })
    }

    /// Singer stream name derived from the topic.
    pub fn stream_name(&self) -> String {
        kafka_types::stream_name_for_topic(&self.topic)
    }
}
