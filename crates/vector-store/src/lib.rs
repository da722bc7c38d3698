//! Per-folder embedded vector database.
//!
//! Each registered folder owns one SQLite database at
//! `<folder>/.folder-mcp/embeddings.db` holding documents, chunks, dense
//! vectors (via sqlite-vec virtual tables), the embedding configuration the
//! database was created with, and the per-file scan state. One process-level
//! writer per folder; readers may share the handle.

use thiserror::Error;

mod migrations;
mod store;

pub use store::{
    ChunkStructure, DocumentMeta, DocumentSummaryRow, FileStateRow, IntegrityReport, NewChunk,
    SearchResult, StoreStats, VectorStore, STATE_DIR_NAME,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("embedding model mismatch: database was built with '{stored}', folder selected '{selected}'")]
    ModelMismatch { stored: String, selected: String },

    #[error("fatal model dimension mismatch: database holds {stored}-dimensional vectors, provider reports {selected}")]
    DimensionMismatch { stored: i64, selected: i64 },

    #[error("storage integrity check failed: {0}")]
    Corrupt(String),

    #[error("store is not ready: {0}")]
    NotReady(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StoreError {
    /// Fatal errors block the folder until an operator intervenes; the
    /// lifecycle must not retry them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ModelMismatch { .. } | Self::DimensionMismatch { .. } | Self::Corrupt(_)
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
