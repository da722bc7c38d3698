use std::{cmp::Ordering, collections::HashMap, fs, path::Path, sync::OnceLock};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};

use crate::{migrations, StoreError, StoreResult};

pub const STATE_DIR_NAME: &str = ".folder-mcp";

const DB_FILE_NAME: &str = "embeddings.db";
const CHUNK_VEC_TABLE: &str = "chunk_embeddings";
const DOC_VEC_TABLE: &str = "document_embeddings";

// Vectors stored here are unit-length; tolerate float drift when deciding
// whether an incoming vector still needs normalization.
const UNIT_NORM_LOW: f32 = 0.999;
const UNIT_NORM_HIGH: f32 = 1.001;

/// Metadata for a document row, supplied by the indexing pipeline.
#[derive(Debug, Clone)]
pub struct DocumentMeta {
    pub file_path: String,
    pub fingerprint: String,
    pub file_size: i64,
    pub last_modified_ns: i64,
    pub parser_kind: String,
}

/// Structural coordinates a parser may attach to a chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkStructure {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sheet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slide: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<String>,
}

impl ChunkStructure {
    pub fn is_empty(&self) -> bool {
        self.page.is_none() && self.sheet.is_none() && self.slide.is_none() && self.heading.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct NewChunk {
    pub start_pos: usize,
    pub end_pos: usize,
    pub token_count: usize,
    pub content: String,
    pub structural: Option<ChunkStructure>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub document_id: i64,
    pub file_path: String,
    pub chunk_index: i64,
    pub start_pos: i64,
    pub end_pos: i64,
    pub content: String,
    pub similarity: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structural: Option<ChunkStructure>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSummaryRow {
    pub id: i64,
    pub file_path: String,
    pub fingerprint: String,
    pub file_size: i64,
    pub last_modified_ns: i64,
    pub parser_kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStateRow {
    pub file_path: String,
    pub fingerprint: String,
    pub mtime_ns: i64,
    pub file_size: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub documents: usize,
    pub chunks: usize,
    pub embeddings: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub documents: usize,
    pub chunks: usize,
    pub chunk_vectors: usize,
    pub orphan_vectors: usize,
}

/// Handle over one folder's embedding database. The daemon keeps exactly one
/// writable handle per folder; `&self` methods are read paths.
#[derive(Debug)]
pub struct VectorStore {
    conn: Connection,
    folder_path: String,
    model_name: String,
    dimension: usize,
}

impl VectorStore {
    /// Open (or create) `<folder>/.folder-mcp/embeddings.db` for the given
    /// model selection. Opening an existing database with a different model
    /// or dimension fails before any write happens.
    pub fn open(folder_path: &Path, model_name: &str, dimension: usize) -> StoreResult<Self> {
        if model_name.trim().is_empty() {
            return Err(StoreError::InvalidQuery(
                "embedding model must be provided".to_string(),
            ));
        }
        if dimension == 0 {
            return Err(StoreError::InvalidQuery(
                "embedding dimension must be positive".to_string(),
            ));
        }

        enable_vec_extension()?;

        let state_dir = folder_path.join(STATE_DIR_NAME);
        fs::create_dir_all(&state_dir)
            .with_context(|| format!("Failed to create state directory at {}", state_dir.display()))?;

        let db_path = state_dir.join(DB_FILE_NAME);
        let mut conn = Connection::open(&db_path)
            .with_context(|| format!("Failed to open embeddings database at {}", db_path.display()))?;

        conn.pragma_update(None, "foreign_keys", 1)
            .context("Failed to enable foreign keys for embeddings database")?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL journal for embeddings database")?;

        migrations::apply_migrations(&mut conn)?;
        check_embedding_config(&conn, model_name, dimension as i64)?;
        ensure_vector_tables(&conn, dimension)?;

        Ok(Self {
            conn,
            folder_path: normalize_folder_path(folder_path),
            model_name: model_name.to_string(),
            dimension,
        })
    }

    pub fn folder_path(&self) -> &str {
        &self.folder_path
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Replace the chunks and vectors of one document atomically. The file
    /// state row is refreshed in the same transaction so a crash never leaves
    /// the scan state ahead of the stored vectors.
    pub fn upsert_document_chunks(
        &mut self,
        doc: &DocumentMeta,
        chunks: &[NewChunk],
        vectors: &[Vec<f32>],
    ) -> StoreResult<i64> {
        self.validate_batch(chunks, vectors)?;
        let prepared = prepare_vectors(vectors, self.dimension)?;

        // Transient sqlite errors (busy/locked) get one retry; validation
        // errors above never reach this point twice.
        match self.upsert_document_chunks_tx(doc, chunks, &prepared) {
            Ok(doc_id) => Ok(doc_id),
            Err(StoreError::Sqlite(first_error)) => {
                tracing::warn!(
                    file = doc.file_path.as_str(),
                    error = %first_error,
                    "retrying document upsert after sqlite error"
                );
                self.upsert_document_chunks_tx(doc, chunks, &prepared)
            }
            Err(other) => Err(other),
        }
    }

    fn upsert_document_chunks_tx(
        &mut self,
        doc: &DocumentMeta,
        chunks: &[NewChunk],
        prepared: &[PreparedVector],
    ) -> StoreResult<i64> {
        let folder_path = self.folder_path.clone();
        let tx = self.conn.transaction()?;

        let doc_id = upsert_document_row(&tx, &folder_path, doc)?;
        clear_document_chunks(&tx, doc_id)?;

        for (index, (chunk, vector)) in chunks.iter().zip(prepared).enumerate() {
            insert_chunk_with_vector(&tx, doc_id, index as i64, chunk, vector)?;
        }

        write_document_vector(&tx, doc_id, prepared, self.dimension)?;
        record_file_state_tx(
            &tx,
            &doc.file_path,
            &doc.fingerprint,
            doc.last_modified_ns,
            doc.file_size,
        )?;

        tx.commit()?;
        Ok(doc_id)
    }

    /// Atomic full rebuild: every existing row is dropped and the supplied
    /// entries become the entire index, or nothing changes at all.
    pub fn rebuild(
        &mut self,
        entries: &[(DocumentMeta, Vec<NewChunk>, Vec<Vec<f32>>)],
    ) -> StoreResult<()> {
        let mut all_prepared = Vec::with_capacity(entries.len());
        for (doc, chunks, vectors) in entries {
            self.validate_batch(chunks, vectors)?;
            let prepared = prepare_vectors(vectors, self.dimension)?;
            all_prepared.push((doc, chunks, prepared));
        }

        let folder_path = self.folder_path.clone();
        let dimension = self.dimension;
        let tx = self.conn.transaction()?;

        tx.execute(&format!("DELETE FROM {CHUNK_VEC_TABLE}"), [])?;
        tx.execute(&format!("DELETE FROM {DOC_VEC_TABLE}"), [])?;
        tx.execute("DELETE FROM chunks", [])?;
        tx.execute("DELETE FROM documents", [])?;
        tx.execute("DELETE FROM file_states", [])?;

        for (doc, chunks, prepared) in &all_prepared {
            let doc_id = upsert_document_row(&tx, &folder_path, doc)?;
            for (index, (chunk, vector)) in chunks.iter().zip(prepared).enumerate() {
                insert_chunk_with_vector(&tx, doc_id, index as i64, chunk, vector)?;
            }
            write_document_vector(&tx, doc_id, prepared, dimension)?;
            record_file_state_tx(
                &tx,
                &doc.file_path,
                &doc.fingerprint,
                doc.last_modified_ns,
                doc.file_size,
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Remove a document, its chunks, its vectors, and its file state.
    /// Returns whether a document row existed.
    pub fn delete_document(&mut self, file_path: &str) -> StoreResult<bool> {
        let tx = self.conn.transaction()?;

        let doc_id: Option<i64> = tx
            .query_row(
                "SELECT id FROM documents WHERE file_path = ?1",
                params![file_path],
                |row| row.get(0),
            )
            .optional()?;

        let Some(doc_id) = doc_id else {
            // Still drop any stale scan state for the path.
            tx.execute("DELETE FROM file_states WHERE file_path = ?1", params![file_path])?;
            tx.commit()?;
            return Ok(false);
        };

        tx.execute(
            &format!(
                "DELETE FROM {CHUNK_VEC_TABLE} \
                 WHERE rowid IN (SELECT id FROM chunks WHERE document_id = ?1)"
            ),
            params![doc_id],
        )?;
        tx.execute(
            &format!("DELETE FROM {DOC_VEC_TABLE} WHERE rowid = ?1"),
            params![doc_id],
        )?;
        tx.execute("DELETE FROM chunks WHERE document_id = ?1", params![doc_id])?;
        tx.execute("DELETE FROM documents WHERE id = ?1", params![doc_id])?;
        tx.execute("DELETE FROM file_states WHERE file_path = ?1", params![file_path])?;

        tx.commit()?;
        Ok(true)
    }

    pub fn mark_for_reindex(&self, file_path: &str) -> StoreResult<()> {
        let updated = self.conn.execute(
            "UPDATE documents SET needs_reindex = 1 WHERE file_path = ?1",
            params![file_path],
        )?;

        if updated == 0 {
            return Err(StoreError::NotReady(format!(
                "document '{}' is not indexed",
                file_path
            )));
        }

        Ok(())
    }

    pub fn documents_needing_reindex(&self) -> StoreResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT file_path FROM documents WHERE needs_reindex = 1 ORDER BY file_path")?;

        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut paths = Vec::new();
        for row in rows {
            paths.push(row?);
        }

        Ok(paths)
    }

    /// Cosine-ranked chunk search. `threshold` filters before ordering; ties
    /// break by ascending `(document_id, chunk_index)` so results are stable.
    pub fn search(&self, query: &[f32], k: usize, threshold: f32) -> StoreResult<Vec<SearchResult>> {
        self.validate_query(query, k)?;

        let query_bytes = f32_slice_to_le_bytes(query);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT d.id, d.file_path, c.chunk_index, c.start_pos, c.end_pos, c.content, c.structural, \
                    1.0 - vec_distance_cosine(ce.embedding, vec_f32(?1)) AS similarity \
             FROM {CHUNK_VEC_TABLE} ce \
             JOIN chunks c ON c.id = ce.rowid \
             JOIN documents d ON d.id = c.document_id"
        ))?;

        let rows = stmt.query_map(params![query_bytes], |row| {
            Ok(SearchResult {
                document_id: row.get(0)?,
                file_path: row.get(1)?,
                chunk_index: row.get(2)?,
                start_pos: row.get(3)?,
                end_pos: row.get(4)?,
                content: row.get(5)?,
                structural: row
                    .get::<_, Option<String>>(6)?
                    .and_then(|json| serde_json::from_str(&json).ok()),
                similarity: row.get::<_, f64>(7)? as f32,
            })
        })?;

        let mut results = Vec::new();
        for row in rows {
            let result = row?;
            if !result.similarity.is_finite() || result.similarity < threshold {
                continue;
            }
            results.push(result);
        }

        results.sort_by(|left, right| {
            right
                .similarity
                .partial_cmp(&left.similarity)
                .unwrap_or(Ordering::Equal)
                .then_with(|| left.document_id.cmp(&right.document_id))
                .then_with(|| left.chunk_index.cmp(&right.chunk_index))
        });
        results.truncate(k);

        Ok(results)
    }

    /// Document-level search over the mean-of-chunks vectors.
    pub fn search_documents(
        &self,
        query: &[f32],
        k: usize,
        threshold: f32,
    ) -> StoreResult<Vec<(DocumentSummaryRow, f32)>> {
        self.validate_query(query, k)?;

        let query_bytes = f32_slice_to_le_bytes(query);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT d.id, d.file_path, d.fingerprint, d.file_size, d.last_modified_ns, d.parser_kind, \
                    1.0 - vec_distance_cosine(de.embedding, vec_f32(?1)) AS similarity \
             FROM {DOC_VEC_TABLE} de \
             JOIN documents d ON d.id = de.rowid"
        ))?;

        let rows = stmt.query_map(params![query_bytes], |row| {
            Ok((
                DocumentSummaryRow {
                    id: row.get(0)?,
                    file_path: row.get(1)?,
                    fingerprint: row.get(2)?,
                    file_size: row.get(3)?,
                    last_modified_ns: row.get(4)?,
                    parser_kind: row.get(5)?,
                },
                row.get::<_, f64>(6)? as f32,
            ))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (doc, similarity) = row?;
            if !similarity.is_finite() || similarity < threshold {
                continue;
            }
            results.push((doc, similarity));
        }

        results.sort_by(|left, right| {
            right
                .1
                .partial_cmp(&left.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| left.0.id.cmp(&right.0.id))
        });
        results.truncate(k);

        Ok(results)
    }

    pub fn stats(&self) -> StoreResult<StoreStats> {
        let documents: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))?;
        let chunks: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        let embeddings: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM {CHUNK_VEC_TABLE}"),
            [],
            |row| row.get(0),
        )?;

        Ok(StoreStats {
            documents: documents as usize,
            chunks: chunks as usize,
            embeddings: embeddings as usize,
        })
    }

    /// Confirm the schema is intact: required tables exist, the config row is
    /// singular, and no chunk vector points at a missing chunk.
    pub fn validate_integrity(&self) -> StoreResult<IntegrityReport> {
        for table in ["documents", "chunks", "embedding_config", "file_states"] {
            if !table_exists(&self.conn, table)? {
                return Err(StoreError::Corrupt(format!("missing table '{table}'")));
            }
        }
        for table in [CHUNK_VEC_TABLE, DOC_VEC_TABLE] {
            if !table_exists(&self.conn, table)? {
                return Err(StoreError::Corrupt(format!("missing vector table '{table}'")));
            }
        }

        let config_rows: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM embedding_config", [], |row| row.get(0))?;
        if config_rows != 1 {
            return Err(StoreError::Corrupt(format!(
                "embedding_config must hold exactly one row, found {config_rows}"
            )));
        }
        let config_id: i64 =
            self.conn
                .query_row("SELECT id FROM embedding_config", [], |row| row.get(0))?;
        if config_id != 1 {
            return Err(StoreError::Corrupt(format!(
                "embedding_config row has id {config_id}, expected 1"
            )));
        }

        let stats = self.stats()?;
        let orphan_vectors: i64 = self.conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {CHUNK_VEC_TABLE} ce \
                 WHERE NOT EXISTS (SELECT 1 FROM chunks c WHERE c.id = ce.rowid)"
            ),
            [],
            |row| row.get(0),
        )?;
        if orphan_vectors > 0 {
            return Err(StoreError::Corrupt(format!(
                "{orphan_vectors} chunk vectors reference missing chunks"
            )));
        }

        Ok(IntegrityReport {
            documents: stats.documents,
            chunks: stats.chunks,
            chunk_vectors: stats.embeddings,
            orphan_vectors: 0,
        })
    }

    pub fn file_states(&self) -> StoreResult<HashMap<String, FileStateRow>> {
        let mut stmt = self
            .conn
            .prepare("SELECT file_path, fingerprint, mtime_ns, file_size FROM file_states")?;

        let rows = stmt.query_map([], |row| {
            Ok(FileStateRow {
                file_path: row.get(0)?,
                fingerprint: row.get(1)?,
                mtime_ns: row.get(2)?,
                file_size: row.get(3)?,
            })
        })?;

        let mut states = HashMap::new();
        for row in rows {
            let state = row?;
            states.insert(state.file_path.clone(), state);
        }

        Ok(states)
    }

    pub fn record_file_state(&self, state: &FileStateRow) -> StoreResult<()> {
        record_file_state_conn(
            &self.conn,
            &state.file_path,
            &state.fingerprint,
            state.mtime_ns,
            state.file_size,
        )
    }

    pub fn remove_file_state(&self, file_path: &str) -> StoreResult<()> {
        self.conn
            .execute("DELETE FROM file_states WHERE file_path = ?1", params![file_path])?;
        Ok(())
    }

    pub fn list_documents(&self) -> StoreResult<Vec<DocumentSummaryRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, file_path, fingerprint, file_size, last_modified_ns, parser_kind \
             FROM documents ORDER BY file_path",
        )?;

        let rows = stmt.query_map([], document_summary_from_row)?;
        let mut documents = Vec::new();
        for row in rows {
            documents.push(row?);
        }

        Ok(documents)
    }

    pub fn document_by_path(&self, file_path: &str) -> StoreResult<Option<DocumentSummaryRow>> {
        self.conn
            .query_row(
                "SELECT id, file_path, fingerprint, file_size, last_modified_ns, parser_kind \
                 FROM documents WHERE file_path = ?1",
                params![file_path],
                document_summary_from_row,
            )
            .optional()
            .map_err(StoreError::from)
    }

    /// Chunk rows for a document in `[offset, offset + limit)` index order.
    pub fn get_chunks(
        &self,
        document_id: i64,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<SearchResult>> {
        let mut stmt = self.conn.prepare(
            "SELECT d.id, d.file_path, c.chunk_index, c.start_pos, c.end_pos, c.content, c.structural \
             FROM chunks c \
             JOIN documents d ON d.id = c.document_id \
             WHERE c.document_id = ?1 AND c.chunk_index >= ?2 \
             ORDER BY c.chunk_index \
             LIMIT ?3",
        )?;

        let rows = stmt.query_map(
            params![document_id, offset as i64, limit as i64],
            |row| {
                Ok(SearchResult {
                    document_id: row.get(0)?,
                    file_path: row.get(1)?,
                    chunk_index: row.get(2)?,
                    start_pos: row.get(3)?,
                    end_pos: row.get(4)?,
                    content: row.get(5)?,
                    structural: row
                        .get::<_, Option<String>>(6)?
                        .and_then(|json| serde_json::from_str(&json).ok()),
                    similarity: 0.0,
                })
            },
        )?;

        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row?);
        }

        Ok(chunks)
    }

    /// Run a caller-supplied unit of work in one transaction.
    pub fn transaction<T>(
        &mut self,
        work: impl FnOnce(&Transaction<'_>) -> Result<T>,
    ) -> StoreResult<T> {
        let tx = self.conn.transaction()?;
        let value = work(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn optimize(&self) -> StoreResult<()> {
        self.conn
            .execute_batch("ANALYZE; PRAGMA wal_checkpoint(TRUNCATE);")
            .context("Failed to optimize embeddings database")?;
        Ok(())
    }

    pub fn close(self) -> StoreResult<()> {
        self.conn
            .close()
            .map_err(|(_conn, error)| StoreError::Sqlite(error))
    }

    fn validate_batch(&self, chunks: &[NewChunk], vectors: &[Vec<f32>]) -> StoreResult<()> {
        if chunks.is_empty() {
            return Err(StoreError::InvalidQuery(
                "refusing to persist an empty chunk batch".to_string(),
            ));
        }
        if chunks.len() != vectors.len() {
            return Err(StoreError::InvalidQuery(format!(
                "chunk/vector count mismatch: {} chunks, {} vectors",
                chunks.len(),
                vectors.len()
            )));
        }
        for chunk in chunks {
            if chunk.start_pos >= chunk.end_pos {
                return Err(StoreError::InvalidQuery(format!(
                    "chunk offsets must satisfy start < end (got [{}, {}))",
                    chunk.start_pos, chunk.end_pos
                )));
            }
        }

        Ok(())
    }

    fn validate_query(&self, query: &[f32], k: usize) -> StoreResult<()> {
        if k == 0 {
            return Err(StoreError::InvalidQuery("k must be positive".to_string()));
        }
        if query.is_empty() {
            return Err(StoreError::InvalidQuery(
                "query vector must not be empty".to_string(),
            ));
        }
        if query.len() != self.dimension {
            return Err(StoreError::InvalidQuery(format!(
                "query vector has dimension {}, store holds {}",
                query.len(),
                self.dimension
            )));
        }
        if !query.iter().all(|value| value.is_finite()) {
            return Err(StoreError::InvalidQuery(
                "query vector contains non-finite values".to_string(),
            ));
        }

        Ok(())
    }
}

struct PreparedVector {
    bytes: Vec<u8>,
    values: Vec<f32>,
}

fn prepare_vectors(vectors: &[Vec<f32>], dimension: usize) -> StoreResult<Vec<PreparedVector>> {
    let mut prepared = Vec::with_capacity(vectors.len());
    for vector in vectors {
        if vector.len() != dimension {
            return Err(StoreError::DimensionMismatch {
                stored: dimension as i64,
                selected: vector.len() as i64,
            });
        }

        let mut values = vector.clone();
        let norm = l2_norm(&values);
        if norm == 0.0 || !norm.is_finite() {
            return Err(StoreError::InvalidQuery(
                "cannot store a zero or non-finite vector".to_string(),
            ));
        }
        if !(UNIT_NORM_LOW..=UNIT_NORM_HIGH).contains(&norm) {
            for value in &mut values {
                *value /= norm;
            }
        }

        prepared.push(PreparedVector {
            bytes: f32_slice_to_le_bytes(&values),
            values,
        });
    }

    Ok(prepared)
}

fn upsert_document_row(
    tx: &Transaction<'_>,
    folder_path: &str,
    doc: &DocumentMeta,
) -> StoreResult<i64> {
    tx.execute(
        "INSERT INTO documents (folder_path, file_path, fingerprint, file_size, last_modified_ns, parser_kind, needs_reindex) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0) \
         ON CONFLICT (folder_path, file_path) DO UPDATE SET \
             fingerprint = excluded.fingerprint, \
             file_size = excluded.file_size, \
             last_modified_ns = excluded.last_modified_ns, \
             parser_kind = excluded.parser_kind, \
             needs_reindex = 0",
        params![
            folder_path,
            doc.file_path,
            doc.fingerprint,
            doc.file_size,
            doc.last_modified_ns,
            doc.parser_kind
        ],
    )?;

    let doc_id: i64 = tx.query_row(
        "SELECT id FROM documents WHERE folder_path = ?1 AND file_path = ?2",
        params![folder_path, doc.file_path],
        |row| row.get(0),
    )?;

    Ok(doc_id)
}

fn clear_document_chunks(tx: &Transaction<'_>, doc_id: i64) -> StoreResult<()> {
    tx.execute(
        &format!(
            "DELETE FROM {CHUNK_VEC_TABLE} \
             WHERE rowid IN (SELECT id FROM chunks WHERE document_id = ?1)"
        ),
        params![doc_id],
    )?;
    tx.execute("DELETE FROM chunks WHERE document_id = ?1", params![doc_id])?;
    Ok(())
}

fn insert_chunk_with_vector(
    tx: &Transaction<'_>,
    doc_id: i64,
    chunk_index: i64,
    chunk: &NewChunk,
    vector: &PreparedVector,
) -> StoreResult<()> {
    let structural = chunk
        .structural
        .as_ref()
        .filter(|structure| !structure.is_empty())
        .map(serde_json::to_string)
        .transpose()
        .map_err(|error| anyhow!("Failed to serialize chunk structure: {error}"))?;

    tx.execute(
        "INSERT INTO chunks (document_id, chunk_index, start_pos, end_pos, token_count, content, structural) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            doc_id,
            chunk_index,
            chunk.start_pos as i64,
            chunk.end_pos as i64,
            chunk.token_count as i64,
            chunk.content,
            structural
        ],
    )?;

    let chunk_id = tx.last_insert_rowid();
    tx.execute(
        &format!("INSERT OR REPLACE INTO {CHUNK_VEC_TABLE} (rowid, embedding) VALUES (?1, vec_f32(?2))"),
        params![chunk_id, vector.bytes],
    )?;

    Ok(())
}

fn write_document_vector(
    tx: &Transaction<'_>,
    doc_id: i64,
    prepared: &[PreparedVector],
    dimension: usize,
) -> StoreResult<()> {
    // Document vector is the normalized mean of its chunk vectors.
    let mut mean = vec![0.0f32; dimension];
    for vector in prepared {
        for (slot, value) in mean.iter_mut().zip(&vector.values) {
            *slot += value;
        }
    }
    let count = prepared.len() as f32;
    for slot in &mut mean {
        *slot /= count;
    }

    let norm = l2_norm(&mean);
    if norm > 0.0 && norm.is_finite() {
        for slot in &mut mean {
            *slot /= norm;
        }
    }

    tx.execute(
        &format!("INSERT OR REPLACE INTO {DOC_VEC_TABLE} (rowid, embedding) VALUES (?1, vec_f32(?2))"),
        params![doc_id, f32_slice_to_le_bytes(&mean)],
    )?;

    Ok(())
}

fn record_file_state_tx(
    tx: &Transaction<'_>,
    file_path: &str,
    fingerprint: &str,
    mtime_ns: i64,
    file_size: i64,
) -> StoreResult<()> {
    tx.execute(
        "INSERT INTO file_states (file_path, fingerprint, mtime_ns, file_size) \
         VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT (file_path) DO UPDATE SET \
             fingerprint = excluded.fingerprint, \
             mtime_ns = excluded.mtime_ns, \
             file_size = excluded.file_size, \
             indexed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
        params![file_path, fingerprint, mtime_ns, file_size],
    )?;
    Ok(())
}

fn record_file_state_conn(
    conn: &Connection,
    file_path: &str,
    fingerprint: &str,
    mtime_ns: i64,
    file_size: i64,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO file_states (file_path, fingerprint, mtime_ns, file_size) \
         VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT (file_path) DO UPDATE SET \
             fingerprint = excluded.fingerprint, \
             mtime_ns = excluded.mtime_ns, \
             file_size = excluded.file_size, \
             indexed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
        params![file_path, fingerprint, mtime_ns, file_size],
    )?;
    Ok(())
}

fn document_summary_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DocumentSummaryRow> {
    Ok(DocumentSummaryRow {
        id: row.get(0)?,
        file_path: row.get(1)?,
        fingerprint: row.get(2)?,
        file_size: row.get(3)?,
        last_modified_ns: row.get(4)?,
        parser_kind: row.get(5)?,
    })
}

fn check_embedding_config(
    conn: &Connection,
    model_name: &str,
    dimension: i64,
) -> StoreResult<()> {
    let existing: Option<(String, i64)> = conn
        .query_row(
            "SELECT model_name, model_dimension FROM embedding_config WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match existing {
        None => {
            conn.execute(
                "INSERT INTO embedding_config (id, model_name, model_dimension) VALUES (1, ?1, ?2)",
                params![model_name, dimension],
            )?;
            Ok(())
        }
        Some((stored_model, stored_dim)) => {
            if stored_model != model_name {
                return Err(StoreError::ModelMismatch {
                    stored: stored_model,
                    selected: model_name.to_string(),
                });
            }
            if stored_dim != dimension {
                return Err(StoreError::DimensionMismatch {
                    stored: stored_dim,
                    selected: dimension,
                });
            }
            Ok(())
        }
    }
}

/// sqlite-vec has to be hooked in as an auto extension before the first
/// connection opens. SQLite only needs this once per process, so the result
/// code of the registration call is latched and every later open re-checks
/// the same outcome.
fn enable_vec_extension() -> StoreResult<()> {
    use rusqlite::ffi::{sqlite3_auto_extension, SQLITE_OK};
    use sqlite_vec::sqlite3_vec_init;

    static REGISTRATION_RC: OnceLock<i32> = OnceLock::new();

    let rc = *REGISTRATION_RC.get_or_init(|| unsafe {
        sqlite3_auto_extension(Some(std::mem::transmute(sqlite3_vec_init as *const ())))
    });

    if rc == SQLITE_OK {
        Ok(())
    } else {
        Err(StoreError::NotReady(format!(
            "vector extension rejected by sqlite (rc {rc})"
        )))
    }
}

fn ensure_vector_tables(conn: &Connection, dimension: usize) -> StoreResult<()> {
    conn.execute_batch(&format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS {CHUNK_VEC_TABLE} USING vec0(embedding float[{dimension}]); \
         CREATE VIRTUAL TABLE IF NOT EXISTS {DOC_VEC_TABLE} USING vec0(embedding float[{dimension}]);"
    ))
    .context("Failed to create vector virtual tables")?;
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> StoreResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        params![table],
        |row| row.get(0),
    )?;

    Ok(exists != 0)
}

fn normalize_folder_path(path: &Path) -> String {
    let normalized = path.to_string_lossy().replace('\\', "/");
    normalized.trim_end_matches('/').to_string()
}

fn f32_slice_to_le_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * std::mem::size_of::<f32>());
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|value| value * value).sum::<f32>().sqrt()
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        path::PathBuf,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::{ChunkStructure, DocumentMeta, NewChunk, VectorStore};
    use crate::StoreError;

    struct StoreHarness {
        root: PathBuf,
    }

    impl StoreHarness {
        fn new(prefix: &str) -> Self {
            let mut root = std::env::temp_dir();
            root.push(format!("{prefix}-{}", unique_id()));
            fs::create_dir_all(&root).expect("temp folder should be created");
            Self { root }
        }

        fn open(&self, model: &str, dimension: usize) -> VectorStore {
            VectorStore::open(&self.root, model, dimension).expect("store should open")
        }
    }

    impl Drop for StoreHarness {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.root);
        }
    }

    fn unique_id() -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock error")
            .as_nanos()
    }

    fn doc(path: &str) -> DocumentMeta {
        DocumentMeta {
            file_path: path.to_string(),
            fingerprint: format!("fp-{path}"),
            file_size: 64,
            last_modified_ns: 1_000,
            parser_kind: "text".to_string(),
        }
    }

    fn chunk(start: usize, end: usize, content: &str) -> NewChunk {
        NewChunk {
            start_pos: start,
            end_pos: end,
            token_count: content.split_whitespace().count(),
            content: content.to_string(),
            structural: None,
        }
    }

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut vector = vec![0.0; dim];
        vector[hot] = 1.0;
        vector
    }

    #[test]
    fn open_persists_embedding_config_and_accepts_reopen() {
        let harness = StoreHarness::new("store-reopen");
        {
            let _store = harness.open("test-model", 4);
        }
        let store = harness.open("test-model", 4);
        assert_eq!(store.model_name(), "test-model");
        assert_eq!(store.dimension(), 4);
    }

    #[test]
    fn reopen_with_different_dimension_fails_without_touching_data() {
        let harness = StoreHarness::new("store-dim-mismatch");
        {
            let mut store = harness.open("test-model", 4);
            store
                .upsert_document_chunks(
                    &doc("a.txt"),
                    &[chunk(0, 5, "hello")],
                    &[unit(4, 0)],
                )
                .expect("upsert should succeed");
        }

        let result = VectorStore::open(&harness.root, "test-model", 8);
        match result {
            Err(StoreError::DimensionMismatch { stored, selected }) => {
                assert_eq!(stored, 4);
                assert_eq!(selected, 8);
            }
            other => panic!("expected dimension mismatch, got {other:?}"),
        }

        // The original data must be untouched.
        let store = harness.open("test-model", 4);
        let stats = store.stats().expect("stats should succeed");
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.chunks, 1);
    }

    #[test]
    fn reopen_with_different_model_fails() {
        let harness = StoreHarness::new("store-model-mismatch");
        {
            let _store = harness.open("model-a", 4);
        }

        let result = VectorStore::open(&harness.root, "model-b", 4);
        assert!(matches!(result, Err(StoreError::ModelMismatch { .. })));
    }

    #[test]
    fn search_orders_by_similarity_and_breaks_ties_by_position() {
        let harness = StoreHarness::new("store-search-order");
        let mut store = harness.open("test-model", 4);

        store
            .upsert_document_chunks(
                &doc("b.txt"),
                &[chunk(0, 8, "exact hit"), chunk(8, 20, "orthogonal")],
                &[unit(4, 0), unit(4, 1)],
            )
            .expect("upsert should succeed");
        store
            .upsert_document_chunks(&doc("a.txt"), &[chunk(0, 9, "also exact")], &[unit(4, 0)])
            .expect("upsert should succeed");

        let results = store.search(&unit(4, 0), 10, 0.0).expect("search should succeed");
        assert_eq!(results.len(), 3);

        // Two exact matches tie at similarity 1.0; lower document id wins.
        assert!((results[0].similarity - 1.0).abs() < 1e-5);
        assert!((results[1].similarity - 1.0).abs() < 1e-5);
        assert!(results[0].document_id < results[1].document_id);
        assert!(results[2].similarity < results[1].similarity);
    }

    #[test]
    fn search_threshold_filters_and_k_clamps() {
        let harness = StoreHarness::new("store-search-clamp");
        let mut store = harness.open("test-model", 4);

        store
            .upsert_document_chunks(
                &doc("a.txt"),
                &[chunk(0, 4, "one"), chunk(4, 8, "two")],
                &[unit(4, 0), unit(4, 1)],
            )
            .expect("upsert should succeed");

        let thresholded = store.search(&unit(4, 0), 10, 0.5).expect("search should succeed");
        assert_eq!(thresholded.len(), 1);
        assert_eq!(thresholded[0].content, "one");

        let clamped = store.search(&unit(4, 0), 100, 0.0).expect("search should succeed");
        assert_eq!(clamped.len(), 2);
    }

    #[test]
    fn search_rejects_zero_k_and_empty_query() {
        let harness = StoreHarness::new("store-search-invalid");
        let store = harness.open("test-model", 4);

        assert!(matches!(
            store.search(&unit(4, 0), 0, 0.0),
            Err(StoreError::InvalidQuery(_))
        ));
        assert!(matches!(
            store.search(&[], 5, 0.0),
            Err(StoreError::InvalidQuery(_))
        ));
        assert!(matches!(
            store.search(&[f32::NAN, 0.0, 0.0, 0.0], 5, 0.0),
            Err(StoreError::InvalidQuery(_))
        ));
    }

    #[test]
    fn vectors_are_normalized_at_store_time() {
        let harness = StoreHarness::new("store-normalize");
        let mut store = harness.open("test-model", 4);

        // Deliberately un-normalized input.
        store
            .upsert_document_chunks(
                &doc("a.txt"),
                &[chunk(0, 4, "long")],
                &[vec![3.0, 0.0, 0.0, 0.0]],
            )
            .expect("upsert should succeed");

        let results = store.search(&unit(4, 0), 1, 0.0).expect("search should succeed");
        assert!((results[0].similarity - 1.0).abs() < 1e-3);
    }

    #[test]
    fn delete_then_upsert_yields_only_new_chunks() {
        let harness = StoreHarness::new("store-delete-reindex");
        let mut store = harness.open("test-model", 4);

        store
            .upsert_document_chunks(
                &doc("a.txt"),
                &[chunk(0, 3, "old"), chunk(3, 9, "stale")],
                &[unit(4, 0), unit(4, 1)],
            )
            .expect("first upsert should succeed");

        let removed = store.delete_document("a.txt").expect("delete should succeed");
        assert!(removed);
        assert_eq!(store.stats().expect("stats").documents, 0);

        store
            .upsert_document_chunks(&doc("a.txt"), &[chunk(0, 3, "new")], &[unit(4, 2)])
            .expect("second upsert should succeed");

        let results = store.search(&unit(4, 2), 10, 0.0).expect("search should succeed");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "new");

        // The old vectors must not be retrievable.
        let stale = store.search(&unit(4, 0), 10, 0.9).expect("search should succeed");
        assert!(stale.is_empty());
    }

    #[test]
    fn upsert_rejects_empty_and_mismatched_batches() {
        let harness = StoreHarness::new("store-batch-validation");
        let mut store = harness.open("test-model", 4);

        assert!(matches!(
            store.upsert_document_chunks(&doc("a.txt"), &[], &[]),
            Err(StoreError::InvalidQuery(_))
        ));
        assert!(matches!(
            store.upsert_document_chunks(&doc("a.txt"), &[chunk(0, 3, "one")], &[]),
            Err(StoreError::InvalidQuery(_))
        ));
        assert!(matches!(
            store.upsert_document_chunks(
                &doc("a.txt"),
                &[chunk(5, 5, "empty range")],
                &[unit(4, 0)]
            ),
            Err(StoreError::InvalidQuery(_))
        ));
    }

    #[test]
    fn structural_coordinates_roundtrip() {
        let harness = StoreHarness::new("store-structural");
        let mut store = harness.open("test-model", 4);

        let mut with_structure = chunk(0, 10, "page text");
        with_structure.structural = Some(ChunkStructure {
            page: Some(3),
            heading: Some("Findings".to_string()),
            ..ChunkStructure::default()
        });

        store
            .upsert_document_chunks(&doc("report.pdf"), &[with_structure], &[unit(4, 0)])
            .expect("upsert should succeed");

        let results = store.search(&unit(4, 0), 1, 0.0).expect("search should succeed");
        let structural = results[0].structural.as_ref().expect("structure should persist");
        assert_eq!(structural.page, Some(3));
        assert_eq!(structural.heading.as_deref(), Some("Findings"));
    }

    #[test]
    fn file_states_roundtrip_and_feed_scan_diffs() {
        let harness = StoreHarness::new("store-file-states");
        let mut store = harness.open("test-model", 4);

        store
            .upsert_document_chunks(&doc("a.txt"), &[chunk(0, 5, "hello")], &[unit(4, 0)])
            .expect("upsert should succeed");

        let states = store.file_states().expect("file states should load");
        assert_eq!(states.len(), 1);
        let state = states.get("a.txt").expect("state for a.txt");
        assert_eq!(state.fingerprint, "fp-a.txt");

        store.remove_file_state("a.txt").expect("remove should succeed");
        assert!(store.file_states().expect("file states").is_empty());
    }

    #[test]
    fn mark_for_reindex_flags_documents() {
        let harness = StoreHarness::new("store-reindex-flag");
        let mut store = harness.open("test-model", 4);

        store
            .upsert_document_chunks(&doc("a.txt"), &[chunk(0, 5, "hello")], &[unit(4, 0)])
            .expect("upsert should succeed");

        store.mark_for_reindex("a.txt").expect("mark should succeed");
        assert_eq!(
            store.documents_needing_reindex().expect("query should succeed"),
            vec!["a.txt".to_string()]
        );

        // Re-upserting clears the flag.
        store
            .upsert_document_chunks(&doc("a.txt"), &[chunk(0, 5, "hello")], &[unit(4, 0)])
            .expect("upsert should succeed");
        assert!(store
            .documents_needing_reindex()
            .expect("query should succeed")
            .is_empty());

        assert!(matches!(
            store.mark_for_reindex("missing.txt"),
            Err(StoreError::NotReady(_))
        ));
    }

    #[test]
    fn integrity_report_counts_match_stats() {
        let harness = StoreHarness::new("store-integrity");
        let mut store = harness.open("test-model", 4);

        store
            .upsert_document_chunks(
                &doc("a.txt"),
                &[chunk(0, 5, "hello"), chunk(5, 11, "world")],
                &[unit(4, 0), unit(4, 1)],
            )
            .expect("upsert should succeed");

        let report = store.validate_integrity().expect("integrity should pass");
        assert_eq!(report.documents, 1);
        assert_eq!(report.chunks, 2);
        assert_eq!(report.chunk_vectors, 2);
        assert_eq!(report.orphan_vectors, 0);
    }

    #[test]
    fn rebuild_replaces_the_entire_index() {
        let harness = StoreHarness::new("store-rebuild");
        let mut store = harness.open("test-model", 4);

        store
            .upsert_document_chunks(&doc("old.txt"), &[chunk(0, 3, "old")], &[unit(4, 0)])
            .expect("seed upsert should succeed");

        store
            .rebuild(&[
                (doc("a.txt"), vec![chunk(0, 3, "new a")], vec![unit(4, 1)]),
                (doc("b.txt"), vec![chunk(0, 3, "new b")], vec![unit(4, 2)]),
            ])
            .expect("rebuild should succeed");

        let stats = store.stats().expect("stats should succeed");
        assert_eq!(stats.documents, 2);
        assert_eq!(stats.chunks, 2);
        assert!(store
            .document_by_path("old.txt")
            .expect("lookup should succeed")
            .is_none());
    }

    #[test]
    fn get_chunks_pages_in_index_order() {
        let harness = StoreHarness::new("store-get-chunks");
        let mut store = harness.open("test-model", 4);

        let doc_id = store
            .upsert_document_chunks(
                &doc("a.txt"),
                &[
                    chunk(0, 3, "c0"),
                    chunk(3, 6, "c1"),
                    chunk(6, 9, "c2"),
                ],
                &[unit(4, 0), unit(4, 1), unit(4, 2)],
            )
            .expect("upsert should succeed");

        let page = store.get_chunks(doc_id, 1, 2).expect("chunk page should load");
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].chunk_index, 1);
        assert_eq!(page[1].chunk_index, 2);
    }
}
