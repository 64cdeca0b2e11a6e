//! Shapes decoded messages into the emitted record layout.

use std::collections::BTreeMap;

use kafka_types::catalog::{COLUMN_MESSAGE, COLUMN_OFFSET, COLUMN_PARTITION, COLUMN_TIMESTAMP};
use kafka_types::{DecodedRecord, RawRecord};
use serde_json::{Map, Value};

use crate::error::DecodeError;

#[derive(Debug, Clone, Default)]
pub struct RecordShaper {
    primary_keys: BTreeMap<String, String>,
}

impl RecordShaper {
    pub fn new(primary_keys: BTreeMap<String, String>) -> Self {
        Self { primary_keys }
    }

    /// Wrap a decoded message with its Kafka metadata and primary key columns.
    ///
    /// Every configured primary key must resolve to a non-null value.
    pub fn shape(&self, raw: &RawRecord, message: Value) -> Result<DecodedRecord, DecodeError> {
        let mut record = Map::new();

        for (column, path) in &self.primary_keys {
            match message.pointer(path) {
                Some(value) if !value.is_null() => {
                    record.insert(column.clone(), value.clone());
                }
                _ => {
                    return Err(DecodeError::MissingPrimaryKey {
                        column: column.clone(),
                        path: path.clone(),
                    })
                }
            }
        }

        record.insert(
            COLUMN_TIMESTAMP.to_string(),
            raw.datetime()
                .map(|ts| Value::String(ts.to_rfc3339()))
                .unwrap_or(Value::Null),
        );
        record.insert(COLUMN_OFFSET.to_string(), Value::from(raw.offset));
        record.insert(COLUMN_PARTITION.to_string(), Value::from(raw.partition));
        record.insert(COLUMN_MESSAGE.to_string(), message);

        Ok(DecodedRecord::new(raw, record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shape_without_primary_keys() {
        let raw = RawRecord::new(2, 15, "").with_timestamp(1_700_000_000_000);
        let record = RecordShaper::default()
            .shape(&raw, json!({"a": 1}))
            .unwrap();

        assert_eq!(
            Value::Object(record.record.clone()),
            json!({
                "message_timestamp": "2023-11-14T22:13:20+00:00",
                "message_offset": 15,
                "message_partition": 2,
                "message": {"a": 1}
            })
        );
        assert_eq!(record.partition, 2);
        assert_eq!(record.offset, 15);
    }

    #[test]
    fn test_shape_without_timestamp() {
        let record = RecordShaper::default()
            .shape(&RawRecord::new(0, 0, ""), json!([1, 2]))
            .unwrap();
        assert_eq!(record.get("message_timestamp"), Some(&Value::Null));
    }

    #[test]
    fn test_shape_with_primary_keys() {
        let shaper = RecordShaper::new(BTreeMap::from([
            ("id".to_string(), "/id".to_string()),
            ("org".to_string(), "/org/0/name".to_string()),
        ]));
        let record = shaper
            .shape(
                &RawRecord::new(0, 1, ""),
                json!({"id": 10, "org": [{"name": "acme"}]}),
            )
            .unwrap();

        assert_eq!(record.get("id"), Some(&json!(10)));
        assert_eq!(record.get("org"), Some(&json!("acme")));
    }

    #[test]
    fn test_missing_primary_key() {
        let shaper = RecordShaper::new(BTreeMap::from([("id".to_string(), "/id".to_string())]));

        for message in [json!({"other": 1}), json!({"id": null}), json!("scalar")] {
            let err = shaper.shape(&RawRecord::new(0, 1, ""), message).unwrap_err();
            assert!(matches!(err, DecodeError::MissingPrimaryKey { .. }));
        }
    }
}
