//! Error types for kafka-types crate.

use thiserror::Error;

/// Errors that can occur while reading or interpreting a catalog.
#[derive(Error, Debug)]
pub enum KafkaTypesError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid catalog: {0}")]
    InvalidCatalog(String),

    #[error("Invalid primary key path '{path}' for column '{column}': must start with '/'")]
    InvalidPrimaryKeyPath { column: String, path: String },
}

/// Result type alias for kafka-types operations.
pub type Result<T> = std::result::Result<T, KafkaTypesError>;
