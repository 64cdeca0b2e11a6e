//! Avro messages in the Confluent schema registry wire format.
//!
//! ```text
//! | 0x00 | schema id (u32, big endian) | Avro binary datum |
//! ```
//!
//! Writer schemas are fetched from `GET <registry>/schemas/ids/<id>` the first
//! time an id is seen and cached for the rest of the run. Connection failures
//! and 5xx answers are retried a bounded number of times.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use apache_avro::{from_avro_datum, types::Value as AvroValue, Schema};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, NaiveDate};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{ConfigError, DecodeError};

const MAGIC_BYTE: u8 = 0;
const HEADER_LEN: usize = 5;
const DEFAULT_FETCH_ATTEMPTS: u32 = 3;
const DEFAULT_FETCH_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct RegistrySchema {
    schema: String,
}

pub struct SchemaRegistryDecoder {
    url: String,
    client: reqwest::Client,
    schemas: Mutex<HashMap<u32, Arc<Schema>>>,
    fetch_attempts: u32,
    fetch_backoff: Duration,
}

impl std::fmt::Debug for SchemaRegistryDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistryDecoder")
            .field("url", &self.url)
            .field("fetch_attempts", &self.fetch_attempts)
            .finish_non_exhaustive()
    }
}

/// Split a payload into its schema id and Avro datum.
pub fn split_wire_format(payload: &[u8]) -> Result<(u32, &[u8]), DecodeError> {
    if payload.len() < HEADER_LEN {
        return Err(DecodeError::WireFormat(format!(
            "payload of {} bytes is shorter than the {HEADER_LEN} byte header",
            payload.len()
        )));
    }
    if payload[0] != MAGIC_BYTE {
        return Err(DecodeError::WireFormat(format!(
            "invalid magic byte: expected {MAGIC_BYTE}, got {}",
            payload[0]
        )));
    }
    let schema_id = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
    Ok((schema_id, &payload[HEADER_LEN..]))
}

impl SchemaRegistryDecoder {
    pub fn new(url: impl Into<String>) -> Result<Self, ConfigError> {
        let url = url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "avro_schema",
                reason: e.to_string(),
            })?;
        Ok(Self {
            url,
            client,
            schemas: Mutex::new(HashMap::new()),
            fetch_attempts: DEFAULT_FETCH_ATTEMPTS,
            fetch_backoff: DEFAULT_FETCH_BACKOFF,
        })
    }

    /// Attempts per schema fetch while the registry is unavailable.
    pub fn with_retries(mut self, attempts: u32, backoff: Duration) -> Self {
        self.fetch_attempts = attempts.max(1);
        self.fetch_backoff = backoff;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn decode(&self, payload: &[u8]) -> Result<Value, DecodeError> {
        let (schema_id, mut datum) = split_wire_format(payload)?;
        let schema = self.schema(schema_id).await?;
        let value = from_avro_datum(&schema, &mut datum, None)
            .map_err(|e| DecodeError::Avro(e.to_string()))?;
        avro_to_json(&value)
    }

    async fn schema(&self, schema_id: u32) -> Result<Arc<Schema>, DecodeError> {
        let mut schemas = self.schemas.lock().await;
        if let Some(schema) = schemas.get(&schema_id) {
            return Ok(Arc::clone(schema));
        }

        let mut attempt = 1;
        let schema = loop {
            match self.fetch(schema_id).await {
                Err(e @ DecodeError::RegistryUnavailable { .. }) if attempt < self.fetch_attempts => {
                    warn!(
                        "Fetching schema {schema_id} failed (attempt {attempt}/{}): {e}",
                        self.fetch_attempts
                    );
                    tokio::time::sleep(self.fetch_backoff).await;
                    attempt += 1;
                }
                result => break result?,
            }
        };

        debug!("Fetched schema {schema_id} from {}", self.url);
        let schema = Arc::new(schema);
        schemas.insert(schema_id, Arc::clone(&schema));
        Ok(schema)
    }

    async fn fetch(&self, schema_id: u32) -> Result<Schema, DecodeError> {
        let endpoint = format!("{}/schemas/ids/{schema_id}", self.url);
        let unavailable = |e: reqwest::Error| DecodeError::RegistryUnavailable {
            url: self.url.clone(),
            reason: e.to_string(),
        };

        let response = self.client.get(&endpoint).send().await.map_err(unavailable)?;
        let status = response.status();
        if status.is_server_error() {
            return Err(DecodeError::RegistryUnavailable {
                url: self.url.clone(),
                reason: format!("{endpoint} returned {status}"),
            });
        }
        if !status.is_success() {
            return Err(DecodeError::Registry {
                schema_id,
                reason: format!("{endpoint} returned {status}"),
            });
        }

        let body: RegistrySchema = response.json().await.map_err(|e| DecodeError::Registry {
            schema_id,
            reason: e.to_string(),
        })?;
        Schema::parse_str(&body.schema).map_err(|e| DecodeError::Registry {
            schema_id,
            reason: e.to_string(),
        })
    }
}

/// Convert a decoded Avro value to JSON.
pub fn avro_to_json(avro: &AvroValue) -> Result<Value, DecodeError> {
    match avro {
        AvroValue::Null => Ok(Value::Null),
        AvroValue::Boolean(b) => Ok(Value::Bool(*b)),
        AvroValue::Int(i) => Ok(json!(i)),
        AvroValue::Long(l) => Ok(json!(l)),
        AvroValue::Float(f) => Ok(json!(f)),
        AvroValue::Double(d) => Ok(json!(d)),
        AvroValue::String(s) => Ok(Value::String(s.clone())),
        AvroValue::Enum(_, symbol) => Ok(Value::String(symbol.clone())),
        AvroValue::Bytes(bytes) | AvroValue::Fixed(_, bytes) => {
            Ok(Value::String(STANDARD.encode(bytes)))
        }
        AvroValue::Union(_, inner) => avro_to_json(inner),
        AvroValue::Array(items) => items
            .iter()
            .map(avro_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        AvroValue::Map(entries) => {
            let mut object = Map::new();
            for (key, value) in entries {
                object.insert(key.clone(), avro_to_json(value)?);
            }
            Ok(Value::Object(object))
        }
        AvroValue::Record(fields) => {
            let mut object = Map::new();
            for (name, value) in fields {
                object.insert(name.clone(), avro_to_json(value)?);
            }
            Ok(Value::Object(object))
        }
        AvroValue::Date(days) => NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(i64::from(*days))))
            .map(|date| Value::String(date.format("%Y-%m-%d").to_string()))
            .ok_or_else(|| DecodeError::Avro(format!("date out of range: {days}"))),
        AvroValue::TimestampMillis(ms) => DateTime::from_timestamp_millis(*ms)
            .map(|ts| Value::String(ts.to_rfc3339()))
            .ok_or_else(|| DecodeError::Avro(format!("timestamp out of range: {ms}"))),
        AvroValue::TimestampMicros(us) => {
            DateTime::from_timestamp(us.div_euclid(1_000_000), (us.rem_euclid(1_000_000) * 1_000) as u32)
                .map(|ts| Value::String(ts.to_rfc3339()))
                .ok_or_else(|| DecodeError::Avro(format!("timestamp out of range: {us}")))
        }
        AvroValue::TimeMillis(ms) => Ok(json!(ms)),
        AvroValue::TimeMicros(us) => Ok(json!(us)),
        AvroValue::Uuid(uuid) => Ok(Value::String(uuid.to_string())),
        other => Err(DecodeError::Avro(format!("unsupported Avro value: {other:?}"))),
    }
}
