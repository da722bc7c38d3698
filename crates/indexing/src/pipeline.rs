use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use embedder::Embedder;
use folder_scan::FileChangeInfo;
use vector_store::{ChunkStructure, DocumentMeta, NewChunk, VectorStore};

use crate::{
    chunking::{chunk_text, ChunkingConfig},
    error_log::{append_error_entry, ErrorLogEntry},
    parser::ParserRegistry,
    PipelineError,
};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub chunking: ChunkingConfig,
    pub embed_batch_size: usize,
    pub max_embed_attempts: u32,
    pub backoff_base: Duration,
    pub file_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            embed_batch_size: 32,
            max_embed_attempts: 3,
            backoff_base: Duration::from_secs(1),
            file_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Indexed { chunks: usize },
    Removed { existed: bool },
}

/// Executes one file's worth of indexing work. Shared by every folder; the
/// store handle passed in decides which database is touched.
pub struct IndexingPipeline {
    parsers: ParserRegistry,
    embedder: Arc<Embedder>,
    config: PipelineConfig,
}

impl IndexingPipeline {
    pub fn new(parsers: ParserRegistry, embedder: Arc<Embedder>, config: PipelineConfig) -> Self {
        Self {
            parsers,
            embedder,
            config,
        }
    }

    pub fn embedder(&self) -> &Arc<Embedder> {
        &self.embedder
    }

    /// Index one added or modified file. Parsing and chunking are synchronous,
    /// embedding happens before the store lock is taken, and the database is
    /// only mutated inside one transaction.
    pub async fn create_or_update(
        &self,
        folder_root: &Path,
        store: &Mutex<VectorStore>,
        change: &FileChangeInfo,
    ) -> Result<TaskOutcome, PipelineError> {
        let abs_path = folder_root.join(&change.path);

        let (parser_kind, parsed) = match self.parsers.parse(&abs_path) {
            Ok(parsed) => parsed,
            Err(error) => {
                self.log_error(folder_root, "parse", &error.to_string(), 0);
                return Err(error);
            }
        };

        let chunks = chunk_text(&parsed.text, &parsed.sentence_ends, &self.config.chunking);
        let fingerprint = match &change.fingerprint {
            Some(value) => value.clone(),
            None => folder_scan::fingerprint_file(&abs_path).map_err(PipelineError::Internal)?,
        };

        let meta = DocumentMeta {
            file_path: change.path.clone(),
            fingerprint,
            file_size: change.size as i64,
            last_modified_ns: change.mtime_ns,
            parser_kind,
        };

        if chunks.is_empty() {
            // A file that chunks to nothing keeps no stale vectors around.
            let mut guard = store.lock().expect("store mutex poisoned");
            guard.delete_document(&change.path)?;
            guard.record_file_state(&vector_store::FileStateRow {
                file_path: meta.file_path.clone(),
                fingerprint: meta.fingerprint.clone(),
                mtime_ns: meta.last_modified_ns,
                file_size: meta.file_size,
            })?;
            return Ok(TaskOutcome::Indexed { chunks: 0 });
        }

        let mut new_chunks = Vec::with_capacity(chunks.len());
        let mut texts = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let content = parsed.text[chunk.start..chunk.end].to_string();
            let structural: Option<ChunkStructure> = parsed.structure_at(chunk.start);
            texts.push(content.clone());
            new_chunks.push(NewChunk {
                start_pos: chunk.start,
                end_pos: chunk.end,
                token_count: chunk.token_count,
                content,
                structural,
            });
        }

        let vectors = match tokio::time::timeout(
            self.config.file_timeout,
            self.embed_all_batches(&texts),
        )
        .await
        {
            Ok(Ok(vectors)) => vectors,
            Ok(Err(error)) => {
                self.log_error(
                    folder_root,
                    "embed",
                    &error.to_string(),
                    self.config.max_embed_attempts,
                );
                return Err(error);
            }
            Err(_elapsed) => {
                let error = PipelineError::Timeout {
                    path: change.path.clone(),
                };
                self.log_error(folder_root, "embed", &error.to_string(), 0);
                return Err(error);
            }
        };

        let chunk_count = new_chunks.len();
        {
            let mut guard = store.lock().expect("store mutex poisoned");
            if let Err(error) = guard.upsert_document_chunks(&meta, &new_chunks, &vectors) {
                self.log_error(folder_root, "persist", &error.to_string(), 0);
                return Err(error.into());
            }
        }

        tracing::debug!(
            file = change.path.as_str(),
            chunks = chunk_count,
            "file indexed"
        );
        Ok(TaskOutcome::Indexed { chunks: chunk_count })
    }

    /// Drop a removed file's document, chunks, and vectors.
    pub async fn remove(
        &self,
        folder_root: &Path,
        store: &Mutex<VectorStore>,
        rel_path: &str,
    ) -> Result<TaskOutcome, PipelineError> {
        let existed = {
            let mut guard = store.lock().expect("store mutex poisoned");
            match guard.delete_document(rel_path) {
                Ok(existed) => existed,
                Err(error) => {
                    self.log_error(folder_root, "remove", &error.to_string(), 0);
                    return Err(error.into());
                }
            }
        };

        tracing::debug!(file = rel_path, existed, "document removed");
        Ok(TaskOutcome::Removed { existed })
    }

    /// Embed every batch, retrying each with exponential backoff before the
    /// file is given up on.
    async fn embed_all_batches(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.embed_batch_size.max(1)) {
            let embedded = self.embed_with_backoff(batch).await?;
            vectors.extend(embedded);
        }
        Ok(vectors)
    }

    async fn embed_with_backoff(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let mut last_error = String::new();
        for attempt in 1..=self.config.max_embed_attempts {
            match self.embedder.embed(batch).await {
                Ok(vectors) => return Ok(vectors),
                Err(error) => {
                    last_error = error.to_string();
                    tracing::warn!(attempt, error = last_error.as_str(), "embedding batch failed");
                    if attempt < self.config.max_embed_attempts {
                        let backoff = self.config.backoff_base * 2u32.pow(attempt - 1);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        Err(PipelineError::EmbeddingFailed {
            attempts: self.config.max_embed_attempts,
            message: last_error,
        })
    }

    fn log_error(&self, folder_root: &Path, op: &str, message: &str, retry: u32) {
        if let Err(error) =
            append_error_entry(folder_root, &ErrorLogEntry::new(op, message, retry))
        {
            tracing::debug!(%error, "failed to append to folder error log");
        }
    }
}
