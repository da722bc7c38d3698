use serde::{Deserialize, Serialize};
use vector_store::ChunkStructure;

use crate::{ApiResult, ApiState, LocalApiError};

use super::{continuation_for, parse_continuation, CHARS_PER_TOKEN, DEFAULT_TOKEN_BUDGET};

const SUMMARY_TOKENS: usize = 160;
const CHUNK_PAGE_LIMIT: usize = 50;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocRef {
    pub folder: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentView {
    pub path: String,
    pub fingerprint: String,
    pub file_size: i64,
    pub last_modified_ns: i64,
    pub parser_kind: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    #[serde(flatten)]
    pub document: DocumentView,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkView {
    pub chunk_index: i64,
    pub start_pos: i64,
    pub end_pos: i64,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structural: Option<ChunkStructure>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunksResponse {
    pub chunks: Vec<ChunkView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResponse {
    pub path: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocSummary {
    pub path: String,
    pub summary: String,
}

pub fn list_documents_in_folder(state: &ApiState, folder: &str) -> ApiResult<Vec<DocumentView>> {
    let handle = state.folder(folder)?;
    let store = handle.store.lock().expect("store mutex poisoned");
    let documents = store.list_documents()?;

    Ok(documents.into_iter().map(view_from_row).collect())
}

pub fn get_doc_metadata(state: &ApiState, doc: &DocRef) -> ApiResult<DocumentMetadata> {
    let handle = state.folder(&doc.folder)?;
    let store = handle.store.lock().expect("store mutex poisoned");

    let row = store
        .document_by_path(&doc.path)?
        .ok_or_else(|| LocalApiError::DocumentNotFound {
            path: doc.path.clone(),
        })?;

    let chunks = store.get_chunks(row.id, 0, usize::MAX >> 1)?;
    Ok(DocumentMetadata {
        document: view_from_row(row),
        chunk_count: chunks.len(),
    })
}

/// Chunk rows for a document, paged by index.
pub fn get_chunks(
    state: &ApiState,
    doc: &DocRef,
    continuation: Option<&str>,
) -> ApiResult<ChunksResponse> {
    let offset = parse_continuation(continuation)?;
    let handle = state.folder(&doc.folder)?;
    let store = handle.store.lock().expect("store mutex poisoned");

    let row = store
        .document_by_path(&doc.path)?
        .ok_or_else(|| LocalApiError::DocumentNotFound {
            path: doc.path.clone(),
        })?;

    // Fetch one extra row to learn whether another page exists.
    let mut rows = store.get_chunks(row.id, offset, CHUNK_PAGE_LIMIT + 1)?;
    let has_more = rows.len() > CHUNK_PAGE_LIMIT;
    rows.truncate(CHUNK_PAGE_LIMIT);
    let next_offset = offset + rows.len();

    Ok(ChunksResponse {
        chunks: rows
            .into_iter()
            .map(|chunk| ChunkView {
                chunk_index: chunk.chunk_index,
                start_pos: chunk.start_pos,
                end_pos: chunk.end_pos,
                content: chunk.content,
                structural: chunk.structural,
            })
            .collect(),
        continuation: continuation_for(next_offset, !has_more),
    })
}

/// Raw document bytes as text, budget-truncated with a byte-offset
/// continuation token.
pub fn download_doc(
    state: &ApiState,
    doc: &DocRef,
    continuation: Option<&str>,
) -> ApiResult<DownloadResponse> {
    let offset = parse_continuation(continuation)?;
    let handle = state.folder(&doc.folder)?;

    {
        let store = handle.store.lock().expect("store mutex poisoned");
        store
            .document_by_path(&doc.path)?
            .ok_or_else(|| LocalApiError::DocumentNotFound {
                path: doc.path.clone(),
            })?;
    }

    let abs_path = handle.root.join(&doc.path);
    let full = std::fs::read_to_string(&abs_path).map_err(|error| LocalApiError::Internal {
        message: format!("failed to read {}: {error}", abs_path.display()),
    })?;

    if offset >= full.len() {
        return Ok(DownloadResponse {
            path: doc.path.clone(),
            content: String::new(),
            continuation: None,
        });
    }

    let budget_bytes = DEFAULT_TOKEN_BUDGET * CHARS_PER_TOKEN;
    let mut end = (offset + budget_bytes).min(full.len());
    while end < full.len() && !full.is_char_boundary(end) {
        end += 1;
    }

    Ok(DownloadResponse {
        path: doc.path.clone(),
        content: full[offset..end].to_string(),
        continuation: continuation_for(end, end >= full.len()),
    })
}

/// Extractive summary: leading chunk content up to a small token budget.
pub fn get_doc_summary(state: &ApiState, doc: &DocRef) -> ApiResult<DocSummary> {
    let handle = state.folder(&doc.folder)?;
    let store = handle.store.lock().expect("store mutex poisoned");

    let row = store
        .document_by_path(&doc.path)?
        .ok_or_else(|| LocalApiError::DocumentNotFound {
            path: doc.path.clone(),
        })?;

    let chunks = store.get_chunks(row.id, 0, 4)?;
    let mut summary = String::new();
    let budget_bytes = SUMMARY_TOKENS * CHARS_PER_TOKEN;
    for chunk in chunks {
        if summary.len() >= budget_bytes {
            break;
        }
        if !summary.is_empty() {
            summary.push(' ');
        }
        summary.push_str(chunk.content.trim());
    }

    if summary.len() > budget_bytes {
        let mut end = budget_bytes;
        while end < summary.len() && !summary.is_char_boundary(end) {
            end += 1;
        }
        summary.truncate(end);
        summary.push('…');
    }

    Ok(DocSummary {
        path: doc.path.clone(),
        summary,
    })
}

pub fn batch_doc_summary(state: &ApiState, folder: &str, paths: &[String]) -> ApiResult<Vec<DocSummary>> {
    if paths.is_empty() {
        return Err(LocalApiError::ValidationFailed {
            message: "at least one document path is required".to_string(),
        });
    }

    let mut summaries = Vec::with_capacity(paths.len());
    for path in paths {
        summaries.push(get_doc_summary(
            state,
            &DocRef {
                folder: folder.to_string(),
                path: path.clone(),
            },
        )?);
    }

    Ok(summaries)
}

/// Flag a document for re-indexing and nudge the daemon to rescan.
pub fn refresh_doc(state: &ApiState, doc: &DocRef) -> ApiResult<()> {
    let handle = state.folder(&doc.folder)?;
    {
        let store = handle.store.lock().expect("store mutex poisoned");
        store
            .document_by_path(&doc.path)?
            .ok_or_else(|| LocalApiError::DocumentNotFound {
                path: doc.path.clone(),
            })?;
        store.mark_for_reindex(&doc.path)?;
    }

    state.request_refresh(crate::RefreshRequest {
        folder_path: doc.folder.clone(),
        file_path: doc.path.clone(),
    });
    Ok(())
}

fn view_from_row(row: vector_store::DocumentSummaryRow) -> DocumentView {
    DocumentView {
        path: row.file_path,
        fingerprint: row.fingerprint,
        file_size: row.file_size,
        last_modified_ns: row.last_modified_ns,
        parser_kind: row.parser_kind,
    }
}
