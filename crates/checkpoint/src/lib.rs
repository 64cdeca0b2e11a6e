//! Checkpoint state for tap-kafka
//!
//! Holds the Singer state document that records, per stream, the last
//! emitted offset of every partition, and the storage backends that persist
//! it between runs.
//!
//! # State Format
//!
//! ```json
//! {
//!     "bookmarks": {
//!         "orders": {
//!             "topic": "orders",
//!             "group_id": "tap-group",
//!             "partition_offsets": {"0": 2499, "1": 17},
//!             "updated_at": "2024-01-01T00:00:00Z"
//!         }
//!     }
//! }
//! ```
//!
//! ## Storage Backends
//!
//! - `FilesystemStore` - Stores the state as a JSON file, replaced atomically
//! - `NullStore` - Discards state (the Singer STATE messages on stdout are
//!   then the only record of progress)

mod filesystem;
mod state;
pub mod store;


pub use filesystem::FilesystemStore;
pub use state::{CheckpointState, PartitionOffsets, StateError, StreamBookmark};
pub use store::{NullStore, StateStore};
