//! Debounced filesystem watching for registered folders.
//!
//! Raw notify events are funneled into a worker thread that coalesces them
//! into [`ChangeBatch`] values. The lifecycle orchestrator treats any batch as
//! a trigger to re-scan the folder; the scanner's fingerprint diff is the
//! source of truth, so the batch only needs to say *that* something changed,
//! not precisely what. Renames therefore degrade to remove + create without
//! losing information.

mod engine;
mod normalize;
mod path;
mod types;
mod worker;

pub use engine::{start_folder_watch, FolderWatcherHandle};
pub use types::{ChangeBatch, FolderWatchError, WatchConfig};
