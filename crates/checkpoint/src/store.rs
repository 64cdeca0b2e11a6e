//! State storage trait
//!
//! This module defines the StateStore trait for backend-agnostic state
//! persistence, plus the no-op backend.

use anyhow::Result;
use async_trait::async_trait;

use crate::CheckpointState;

/// Trait for state storage operations.
///
/// This trait abstracts where the state survives between runs:
/// - Filesystem storage (`FilesystemStore`)
/// - Nowhere (`NullStore`)
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read the state written by the previous run.
    ///
    /// Returns None if no state was ever stored.
    async fn read_state(&self) -> Result<Option<CheckpointState>>;

    /// Persist the state. Must not leave a partially written state behind.
    async fn store_state(&self, state: &CheckpointState) -> Result<()>;
}

/// A store that keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

#[async_trait]
impl StateStore for NullStore {
    async fn read_state(&self) -> Result<Option<CheckpointState>> {
        Ok(None)
    }

    async fn store_state(&self, _state: &CheckpointState) -> Result<()> {
        Ok(())
    }
}
