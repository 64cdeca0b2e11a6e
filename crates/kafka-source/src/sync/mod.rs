//! The consume loop.
//!
//! One sequential task owns the source, the accumulator and the offset
//! tracker. A cycle polls, decodes into the open batch and, when the batch is
//! due, emits it and checkpoints the offsets it covers:
//!
//! ```text
//! Initializing -> Consuming -> Flushing -> Committing -> Consuming
//!                     |                                     |
//!                     +-> Rebalancing -> Consuming          +-> Terminated
//! ```

mod engine;

use std::fmt;

pub use engine::SyncEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Initializing,
    Consuming,
    Flushing,
    Committing,
    Rebalancing,
    Terminated,
}

/// Why the consume loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    MaxRuntime,
    /// No message for `consumer_timeout`
    Idle,
    Shutdown,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::MaxRuntime => write!(f, "max runtime reached"),
            TerminationReason::Idle => write!(f, "no new messages within consumer timeout"),
            TerminationReason::Shutdown => write!(f, "shutdown requested"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    pub batches: usize,
    pub records_emitted: usize,
    pub records_skipped: usize,
    /// Records recovered from the local store at startup
    pub records_replayed: usize,
    pub reason: TerminationReason,
}
