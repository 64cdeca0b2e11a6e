//! Filesystem-based state storage implementation.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::store::StateStore;
use crate::CheckpointState;

/// Filesystem implementation of StateStore trait.
///
/// Stores the state as one JSON file. Writes go to a sibling temp file which
/// is synced and then renamed over the target, so a crash leaves either the
/// old or the new state.
pub struct FilesystemStore {
    path: PathBuf,
}

impl FilesystemStore {
    /// Create a new FilesystemStore writing to the given file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the state file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StateStore for FilesystemStore {
    async fn read_state(&self) -> Result<Option<CheckpointState>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file {}", self.path.display()))?;
        let state = CheckpointState::from_json(&content)
            .with_context(|| format!("Invalid state file {}", self.path.display()))?;
        Ok(Some(state))
    }

    async fn store_state(&self, state: &CheckpointState) -> Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let tmp = self.tmp_path();
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(serde_json::to_string_pretty(state)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        File::open(&parent)?.sync_all()?;

        tracing::debug!("Stored state to {}", self.path.display());
        Ok(())
    }
}
