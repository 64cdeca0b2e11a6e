//! tap-kafka
//!
//! A Singer tap that reads one Kafka topic and writes its messages to stdout
//! as Singer RECORD messages, followed by STATE messages holding the last
//! emitted offset of every partition.
//!
//! # CLI Usage
//!
//! ```bash
//! # Check the topic and print its catalog
//! tap-kafka --config config.json --discover > catalog.json
//!
//! # Sync the selected stream, resuming from a previous state
//! tap-kafka --config config.json --catalog catalog.json --state state.json
//! ```
//!
//! The consume loop, decoders and local store live in `tap_kafka_source`;
//! this crate wires them to the command line.

pub mod config;
pub mod discover;
pub mod sync;

pub use config::{load_catalog, load_config, load_state};
pub use sync::SyncArgs;
