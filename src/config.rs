//! Loading of the tap's input files.

use std::path::Path;

use anyhow::Context;
use checkpoint::{CheckpointState, StateStore};
use kafka_types::Catalog;
use tap_kafka_source::TopicConfig;
use tracing::info;

/// Read the JSON config file and apply defaults.
pub fn load_config(path: &Path) -> anyhow::Result<TopicConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let raw: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Config file {} is not valid JSON", path.display()))?;
    let config = TopicConfig::from_raw(raw)
        .with_context(|| format!("Invalid config in {}", path.display()))?;
    Ok(config)
}

pub fn load_catalog(path: &Path) -> anyhow::Result<Catalog> {
    Catalog::from_file(path).with_context(|| format!("Failed to load catalog {}", path.display()))
}

/// State to start from: the `--state` file when given, otherwise whatever
/// the store kept from the previous run.
pub async fn load_state(
    state_file: Option<&Path>,
    store: &dyn StateStore,
) -> anyhow::Result<CheckpointState> {
    if let Some(path) = state_file {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file {}", path.display()))?;
        return CheckpointState::from_json(&content)
            .with_context(|| format!("Invalid state file {}", path.display()));
    }

    match store.read_state().await? {
        Some(state) => {
            info!("Loaded state from previous run");
            Ok(state)
        }
        None => Ok(CheckpointState::new()),
    }
}
