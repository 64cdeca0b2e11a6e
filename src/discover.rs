//! Discovery mode.

use std::io::Write;

use anyhow::Context;
use kafka_types::{generate_catalog, Catalog};
use tap_kafka_source::{check_topic, TopicConfig};
use tracing::info;

/// Catalog describing the configured topic.
pub fn catalog_for(config: &TopicConfig) -> anyhow::Result<Catalog> {
    generate_catalog(&config.topic, &config.primary_keys).context("Failed to generate catalog")
}

/// Check the topic is reachable and print its catalog.
pub async fn run(config: &TopicConfig, mut out: impl Write) -> anyhow::Result<()> {
    info!("Running discovery for topic {}", config.topic);

    let topic_config = config.clone();
    tokio::task::spawn_blocking(move || check_topic(&topic_config))
        .await
        .context("Topic check task failed")??;

    let catalog = catalog_for(config)?;
    serde_json::to_writer_pretty(&mut out, &catalog)?;
    writeln!(out)?;
    out.flush()?;

    info!("Discovery finished");
    Ok(())
}
