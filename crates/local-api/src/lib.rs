//! Transport-agnostic service layer for the daemon's RPC surface.
//!
//! The MCP stdio server and the local-socket HTTP router both call into these
//! services; neither transport owns any logic of its own. Responses that can
//! grow carry a token budget and return a continuation token when truncated.

pub mod services;
mod state;

pub use state::{ApiState, FolderHandle, RefreshRequest};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalApiErrorKind {
    NotFound,
    InvalidInput,
    NotReady,
    Internal,
}

#[derive(Debug, Error)]
pub enum LocalApiError {
    #[error("folder not found: {folder}")]
    FolderNotFound { folder: String },

    #[error("document not found: {path}")]
    DocumentNotFound { path: String },

    #[error("validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("not ready: {message}")]
    NotReady { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl LocalApiError {
    pub fn kind(&self) -> LocalApiErrorKind {
        match self {
            Self::FolderNotFound { .. } | Self::DocumentNotFound { .. } => {
                LocalApiErrorKind::NotFound
            }
            Self::ValidationFailed { .. } => LocalApiErrorKind::InvalidInput,
            Self::NotReady { .. } => LocalApiErrorKind::NotReady,
            Self::Internal { .. } => LocalApiErrorKind::Internal,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::FolderNotFound { .. } => "FOLDER_NOT_FOUND",
            Self::DocumentNotFound { .. } => "DOCUMENT_NOT_FOUND",
            Self::ValidationFailed { .. } => "VALIDATION_FAILED",
            Self::NotReady { .. } => "NOT_READY",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

impl From<anyhow::Error> for LocalApiError {
    fn from(error: anyhow::Error) -> Self {
        Self::Internal {
            message: error.to_string(),
        }
    }
}

impl From<vector_store::StoreError> for LocalApiError {
    fn from(error: vector_store::StoreError) -> Self {
        match error {
            vector_store::StoreError::InvalidQuery(message) => {
                Self::ValidationFailed { message }
            }
            vector_store::StoreError::NotReady(message) => Self::NotReady { message },
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}

impl From<embedder::EmbedError> for LocalApiError {
    fn from(error: embedder::EmbedError) -> Self {
        match error {
            embedder::EmbedError::EmptyBatch => Self::ValidationFailed {
                message: "query must not be empty".to_string(),
            },
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}

pub type ApiResult<T> = Result<T, LocalApiError>;
