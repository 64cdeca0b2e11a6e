//! Singer catalog for the consumed topic.
//!
//! Discovery does not sample messages: the stream schema is fixed. Every
//! record carries the Kafka metadata columns plus the raw decoded `message`,
//! and one extra column per configured primary key.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{KafkaTypesError, Result};

/// Column holding the message timestamp (RFC 3339).
pub const COLUMN_TIMESTAMP: &str = "message_timestamp";
/// Column holding the Kafka offset.
pub const COLUMN_OFFSET: &str = "message_offset";
/// Column holding the Kafka partition.
pub const COLUMN_PARTITION: &str = "message_partition";
/// Column holding the decoded message.
pub const COLUMN_MESSAGE: &str = "message";

/// A Singer catalog: the list of streams a tap can emit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub streams: Vec<CatalogEntry>,
}

/// One stream of the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub tap_stream_id: String,
    pub stream: String,
    #[serde(default)]
    pub key_properties: Vec<String>,
    pub schema: Value,
    #[serde(default)]
    pub metadata: Vec<MetadataEntry>,
}

/// Singer metadata attached to a breadcrumb of the stream schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub breadcrumb: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl Catalog {
    /// Load a catalog (or legacy properties) file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            KafkaTypesError::InvalidCatalog(format!(
                "cannot read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Find a stream by `tap_stream_id`, if it is selected for sync.
    pub fn selected_stream(&self, tap_stream_id: &str) -> Option<&CatalogEntry> {
        self.streams
            .iter()
            .find(|s| s.tap_stream_id == tap_stream_id)
            .filter(|s| {
                let selected = s.is_selected();
                if !selected {
                    tracing::info!("Stream {tap_stream_id} is present but not selected");
                }
                selected
            })
    }
}

impl CatalogEntry {
    /// Whether the stream is selected, either through metadata at the
    /// empty breadcrumb or through the legacy `schema.selected` flag.
    pub fn is_selected(&self) -> bool {
        let from_metadata = self
            .metadata
            .iter()
            .find(|m| m.breadcrumb.is_empty())
            .and_then(|m| m.metadata.get("selected"))
            .and_then(Value::as_bool);

        match from_metadata {
            Some(selected) => selected,
            None => self
                .schema
                .get("selected")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        }
    }
}

/// Derive the Singer stream name from a topic name.
///
/// Kafka allows `.` and `-` in topic names; downstream targets usually turn
/// stream names into table names, so anything outside `[A-Za-z0-9_]` becomes `_`.
pub fn stream_name_for_topic(topic: &str) -> String {
    topic
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Build the catalog for a topic.
///
/// `primary_keys` maps output column names to JSON pointers into the decoded
/// message, e.g. `{"id": "/id"}`.
pub fn generate_catalog(topic: &str, primary_keys: &BTreeMap<String, String>) -> Result<Catalog> {
    for (column, path) in primary_keys {
        if !path.starts_with('/') {
            return Err(KafkaTypesError::InvalidPrimaryKeyPath {
                column: column.clone(),
                path: path.clone(),
            });
        }
    }

    let stream = stream_name_for_topic(topic);

    let mut properties = Map::new();
    properties.insert(
        COLUMN_TIMESTAMP.to_string(),
        json!({"type": ["null", "string"], "format": "date-time"}),
    );
    properties.insert(COLUMN_OFFSET.to_string(), json!({"type": ["integer"]}));
    properties.insert(COLUMN_PARTITION.to_string(), json!({"type": ["integer"]}));
    properties.insert(
        COLUMN_MESSAGE.to_string(),
        json!({"type": ["object", "array", "string", "null"]}),
    );
    for column in primary_keys.keys() {
        properties.insert(
            column.clone(),
            json!({"type": ["string", "integer", "number", "boolean"]}),
        );
    }

    let key_properties: Vec<String> = primary_keys.keys().cloned().collect();

    let mut stream_metadata = Map::new();
    stream_metadata.insert("table-key-properties".to_string(), json!(key_properties));
    stream_metadata.insert("forced-replication-method".to_string(), json!("LOG_BASED"));

    Ok(Catalog {
        streams: vec![CatalogEntry {
            tap_stream_id: stream.clone(),
            stream,
            key_properties,
            schema: json!({
                "type": "object",
                "properties": properties,
            }),
            metadata: vec![MetadataEntry {
                breadcrumb: vec![],
                metadata: stream_metadata,
            }],
        }],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_stream_name_for_topic() {
        assert_eq!(stream_name_for_topic("orders"), "orders");
        assert_eq!(stream_name_for_topic("prod.orders-v2"), "prod_orders_v2");
    }

    #[test]
    fn test_generate_catalog_without_primary_keys() {
        let catalog = generate_catalog("events.raw", &BTreeMap::new()).unwrap();
        assert_eq!(catalog.streams.len(), 1);

        let entry = &catalog.streams[0];
        assert_eq!(entry.tap_stream_id, "events_raw");
        assert!(entry.key_properties.is_empty());

        let props = entry.schema["properties"].as_object().unwrap();
        assert!(props.contains_key(COLUMN_TIMESTAMP));
        assert!(props.contains_key(COLUMN_OFFSET));
        assert!(props.contains_key(COLUMN_PARTITION));
        assert!(props.contains_key(COLUMN_MESSAGE));
        assert_eq!(props.len(), 4);
    }

    #[test]
    fn test_generate_catalog_with_primary_keys() {
        let catalog = generate_catalog("users", &pk(&[("id", "/id"), ("org", "/org/id")])).unwrap();
        let entry = &catalog.streams[0];

        assert_eq!(entry.key_properties, vec!["id".to_string(), "org".to_string()]);
        assert!(entry.schema["properties"]["org"].is_object());
        assert_eq!(
            entry.metadata[0].metadata["table-key-properties"],
            json!(["id", "org"])
        );
    }

    #[test]
    fn test_generate_catalog_rejects_relative_path() {
        let err = generate_catalog("users", &pk(&[("id", "id")])).unwrap_err();
        assert!(err.to_string().contains("must start with '/'"));
    }

    #[test]
    fn test_generated_stream_is_not_selected() {
        let catalog = generate_catalog("users", &BTreeMap::new()).unwrap();
        assert!(catalog.selected_stream("users").is_none());
    }

    #[test]
    fn test_selected_through_metadata() {
        let catalog: Catalog = serde_json::from_value(json!({
            "streams": [{
                "tap_stream_id": "users",
                "stream": "users",
                "schema": {"type": "object", "properties": {}},
                "metadata": [{"breadcrumb": [], "metadata": {"selected": true}}]
            }]
        }))
        .unwrap();

        assert!(catalog.selected_stream("users").is_some());
        assert!(catalog.selected_stream("other").is_none());
    }

    #[test]
    fn test_selected_through_legacy_schema_flag() {
        let catalog: Catalog = serde_json::from_value(json!({
            "streams": [{
                "tap_stream_id": "users",
                "stream": "users",
                "schema": {"type": "object", "selected": true, "properties": {}}
            }]
        }))
        .unwrap();

        assert!(catalog.selected_stream("users").is_some());
    }

    #[test]
    fn test_metadata_overrides_legacy_flag() {
        let catalog: Catalog = serde_json::from_value(json!({
            "streams": [{
                "tap_stream_id": "users",
                "stream": "users",
                "schema": {"type": "object", "selected": true},
                "metadata": [{"breadcrumb": [], "metadata": {"selected": false}}]
            }]
        }))
        .unwrap();

        assert!(catalog.selected_stream("users").is_none());
    }
}
