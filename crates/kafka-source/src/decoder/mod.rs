//! Message value decoding.
//!
//! The decoder is chosen once from the config: plain text JSON, or Avro
//! through a schema registry when `avro_schema` holds a registry URL.

mod plain;
mod registry;

pub use plain::{Encoding, PlainTextDecoder};
pub use registry::{avro_to_json, split_wire_format, SchemaRegistryDecoder};

use kafka_types::RawRecord;
use serde_json::Value;
use tracing::info;

use crate::config::TopicConfig;
use crate::error::{ConfigError, DecodeError};

#[derive(Debug)]
pub enum MessageDecoder {
    PlainText(PlainTextDecoder),
    SchemaRegistry(SchemaRegistryDecoder),
}

impl MessageDecoder {
    pub fn from_config(config: &TopicConfig) -> Result<Self, ConfigError> {
        match &config.avro_schema {
            Some(url) => {
                info!("avro_schema value set to {url}, using avro deserializer.");
                let decoder = SchemaRegistryDecoder::new(url.as_str())?
                    .with_retries(config.max_emit_attempts, config.emit_retry_backoff);
                Ok(MessageDecoder::SchemaRegistry(decoder))
            }
            None => Ok(MessageDecoder::PlainText(PlainTextDecoder::new(
                config.encoding,
            ))),
        }
    }

    /// Decode the value of a message. Tombstones have nothing to decode.
    pub async fn decode(&self, raw: &RawRecord) -> Result<Value, DecodeError> {
        let payload = raw.value.as_deref().ok_or(DecodeError::MissingPayload)?;
        match self {
            MessageDecoder::PlainText(decoder) => decoder.decode(payload),
            MessageDecoder::SchemaRegistry(decoder) => decoder.decode(payload).await,
        }
    }
}
