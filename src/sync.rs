//! Sync mode.

use std::path::PathBuf;

use checkpoint::{FilesystemStore, NullStore, StateStore};
use tap_kafka_source::{
    KafkaSource, LocalBuffer, SingerSink, SyncEngine, SyncSummary, TopicConfig,
};
use tokio::sync::watch;
use tracing::info;

use crate::config::{load_catalog, load_state};

pub struct SyncArgs {
    pub catalog: PathBuf,
    pub state: Option<PathBuf>,
    /// Where the state is kept between runs, besides the STATE messages
    pub state_output: Option<PathBuf>,
}

fn state_store(args: &SyncArgs) -> Box<dyn StateStore> {
    match &args.state_output {
        Some(path) => Box::new(FilesystemStore::new(path)),
        None => Box::new(NullStore),
    }
}

/// Consume the topic if its stream is selected in the catalog.
///
/// Returns `None` when nothing was selected.
pub async fn run(
    config: &TopicConfig,
    args: SyncArgs,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<Option<SyncSummary>> {
    let catalog = load_catalog(&args.catalog)?;
    let stream = config.stream_name();
    let Some(entry) = catalog.selected_stream(&stream).cloned() else {
        info!("No properties were selected");
        return Ok(None);
    };

    let store = state_store(&args);
    let initial = load_state(args.state.as_deref(), store.as_ref()).await?;

    info!(
        "Syncing stream {stream} from topic {} (group {})",
        config.topic, config.group_id
    );
    // The local store lock must be held before joining the group.
    let buffer = LocalBuffer::for_config(config)?;
    let source = KafkaSource::connect(config)?;
    let engine = SyncEngine::new(
        config,
        entry,
        buffer,
        source,
        SingerSink::stdout(),
        store,
        shutdown,
    )?;
    let summary = engine.run(initial).await?;
    Ok(Some(summary))
}
