//! Singer state document.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Partition id to last committed (last emitted) offset.
///
/// Serialized with string keys, as JSON requires.
pub type PartitionOffsets = BTreeMap<i32, i64>;

/// Errors raised while updating checkpoint state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error(
        "Offset regression for stream '{stream}' partition {partition}: \
         checkpoint is at {current}, attempted {attempted}"
    )]
    Regression {
        stream: String,
        partition: i32,
        current: i64,
        attempted: i64,
    },
}

/// Progress of one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamBookmark {
    pub topic: String,
    pub group_id: String,
    #[serde(default)]
    pub partition_offsets: PartitionOffsets,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// The full state document exchanged with the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    #[serde(default)]
    pub bookmarks: BTreeMap<String, StreamBookmark>,
}

impl CheckpointState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a state document. An empty document is an empty state.
    pub fn from_json(content: &str) -> serde_json::Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(content)
    }

    pub fn bookmark(&self, stream: &str) -> Option<&StreamBookmark> {
        self.bookmarks.get(stream)
    }

    /// Committed offsets of a stream, empty when the stream has no bookmark.
    pub fn partition_offsets(&self, stream: &str) -> PartitionOffsets {
        self.bookmarks
            .get(stream)
            .map(|b| b.partition_offsets.clone())
            .unwrap_or_default()
    }

    /// Merge newly committed offsets into the stream's bookmark.
    ///
    /// Every partition must stay at or above its recorded offset; on a
    /// regression nothing is applied.
    pub fn advance(
        &mut self,
        stream: &str,
        topic: &str,
        group_id: &str,
        offsets: &PartitionOffsets,
    ) -> Result<(), StateError> {
        if let Some(existing) = self.bookmarks.get(stream) {
            for (&partition, &attempted) in offsets {
                if let Some(&current) = existing.partition_offsets.get(&partition) {
                    if attempted < current {
                        return Err(StateError::Regression {
                            stream: stream.to_string(),
                            partition,
                            current,
                            attempted,
                        });
                    }
                }
            }
        }

        let bookmark = self
            .bookmarks
            .entry(stream.to_string())
            .or_insert_with(|| StreamBookmark {
                topic: topic.to_string(),
                group_id: group_id.to_string(),
                partition_offsets: PartitionOffsets::new(),
                updated_at: None,
            });
        bookmark.topic = topic.to_string();
        bookmark.group_id = group_id.to_string();
        bookmark.partition_offsets.extend(offsets);
        bookmark.updated_at = Some(Utc::now());
        Ok(())
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}
