use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeBatch {
    pub seq: u64,
    pub rel_created: Vec<String>,
    pub rel_modified: Vec<String>,
    pub rel_removed: Vec<String>,
    /// Set when events were lost or ambiguous; the folder needs a full scan.
    pub rescan: bool,
    pub emitted_at_unix_ms: u64,
}

impl ChangeBatch {
    pub(crate) fn empty_with_seq(seq: u64) -> Self {
        Self {
            seq,
            rel_created: Vec::new(),
            rel_modified: Vec::new(),
            rel_removed: Vec::new(),
            rescan: false,
            emitted_at_unix_ms: now_unix_ms(),
        }
    }

    pub fn has_payload(&self) -> bool {
        self.rescan
            || !self.rel_created.is_empty()
            || !self.rel_modified.is_empty()
            || !self.rel_removed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub debounce_ms: u64,
    pub channel_capacity: usize,
    pub max_batch_paths: usize,
    pub recursive: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 250,
            channel_capacity: 4096,
            max_batch_paths: 10_000,
            recursive: true,
        }
    }
}

impl WatchConfig {
    pub(crate) fn normalized(&self) -> Self {
        Self {
            debounce_ms: self.debounce_ms.max(1),
            channel_capacity: self.channel_capacity.max(1),
            max_batch_paths: self.max_batch_paths.max(1),
            recursive: self.recursive,
        }
    }
}

#[derive(Debug, Error)]
pub enum FolderWatchError {
    #[error("folder root does not exist: {0}")]
    FolderRootNotFound(String),
    #[error("folder root is not a directory: {0}")]
    FolderRootNotDirectory(String),
    #[error("failed to canonicalize folder root {path}: {source}")]
    CanonicalizeFolderRoot {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to initialize watcher: {0}")]
    WatcherInit(#[from] notify::Error),
    #[error("failed to watch path {path}: {source}")]
    WatchPath { path: String, source: notify::Error },
    #[error("worker thread join failed")]
    WorkerJoin,
}

pub(crate) fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
