//! Per-file indexing pipeline: parse → chunk → embed → persist.
//!
//! Each file is processed in isolation. A parse or embedding failure skips
//! that file, appends a record to the folder's `errors.log`, and leaves the
//! rest of the folder untouched. Database mutation for a file happens inside
//! one transaction, and embeddings are generated before the store lock is
//! taken so readers are never blocked by inference.

use thiserror::Error;

mod chunking;
mod error_log;
mod parser;
mod pipeline;

pub use chunking::{chunk_text, ChunkingConfig};
pub use error_log::{append_error_entry, ErrorLogEntry};
pub use parser::{DocumentParser, MarkdownParser, ParsedDocument, ParserRegistry, PlainTextParser};
pub use pipeline::{IndexingPipeline, PipelineConfig, TaskOutcome};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no parser registered for '{path}'")]
    NoParser { path: String },

    #[error("failed to parse '{path}': {message}")]
    ParseFailed { path: String, message: String },

    #[error("embedding failed after {attempts} attempts: {message}")]
    EmbeddingFailed { attempts: u32, message: String },

    #[error("file '{path}' exceeded the indexing timeout")]
    Timeout { path: String },

    #[error(transparent)]
    Store(#[from] vector_store::StoreError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
