use serde::{Deserialize, Serialize};
use vector_store::ChunkStructure;

use crate::{ApiResult, ApiState, LocalApiError};

use super::{continuation_for, estimate_tokens, parse_continuation, DEFAULT_TOKEN_BUDGET};

const MAX_K: usize = 100;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchInput {
    /// Restrict the search to one registered folder; all folders otherwise.
    pub folder: Option<String>,
    pub query: String,
    pub k: usize,
    pub threshold: Option<f32>,
    pub continuation: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkSearchEntry {
    pub folder: String,
    pub path: String,
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
pub struct DocSearchEntry {
    pub folder: String,
    pub path: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse<T> {
    pub results: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingResponse {
    pub model: String,
    pub dimension: usize,
    pub vector: Vec<f32>,
}

/// Cosine-ranked chunk search across the registered folders.
pub async fn search_chunks(
    state: &ApiState,
    input: SearchInput,
) -> ApiResult<SearchResponse<ChunkSearchEntry>> {
    let (query_vector, threshold, offset) = prepare_search(state, &input).await?;
    // One row past the page so truncation is detectable.
    let fetch = offset + input.k + 1;

    let mut merged: Vec<ChunkSearchEntry> = Vec::new();
    for handle in selected_folders(state, input.folder.as_deref())? {
        let store = handle.store.lock().expect("store mutex poisoned");
        let results = store.search(&query_vector, fetch, threshold)?;
        drop(store);

        merged.extend(results.into_iter().map(|result| ChunkSearchEntry {
            folder: handle.folder_path.clone(),
            path: result.file_path,
            chunk_index: result.chunk_index,
            start_pos: result.start_pos,
            end_pos: result.end_pos,
            content: result.content,
            similarity: result.similarity,
            structural: result.structural,
        }));
    }

    merged.sort_by(|left, right| {
        right
            .similarity
            .partial_cmp(&left.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| left.folder.cmp(&right.folder))
            .then_with(|| left.path.cmp(&right.path))
            .then_with(|| left.chunk_index.cmp(&right.chunk_index))
    });

    let (page, next_offset, exhausted) = budgeted_page(merged, offset, input.k, |entry| {
        estimate_tokens(&entry.content)
    });

    Ok(SearchResponse {
        results: page,
        continuation: continuation_for(next_offset, exhausted),
    })
}

/// Document-level search over mean-of-chunk vectors.
pub async fn search_docs(
    state: &ApiState,
    input: SearchInput,
) -> ApiResult<SearchResponse<DocSearchEntry>> {
    let (query_vector, threshold, offset) = prepare_search(state, &input).await?;
    let fetch = offset + input.k + 1;

    let mut merged: Vec<DocSearchEntry> = Vec::new();
    for handle in selected_folders(state, input.folder.as_deref())? {
        let store = handle.store.lock().expect("store mutex poisoned");
        let results = store.search_documents(&query_vector, fetch, threshold)?;
        drop(store);

        merged.extend(results.into_iter().map(|(doc, similarity)| DocSearchEntry {
            folder: handle.folder_path.clone(),
            path: doc.file_path,
            similarity,
        }));
    }

    merged.sort_by(|left, right| {
        right
            .similarity
            .partial_cmp(&left.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| left.folder.cmp(&right.folder))
            .then_with(|| left.path.cmp(&right.path))
    });

    let (page, next_offset, exhausted) =
        budgeted_page(merged, offset, input.k, |entry| estimate_tokens(&entry.path));

    Ok(SearchResponse {
        results: page,
        continuation: continuation_for(next_offset, exhausted),
    })
}

/// Encode arbitrary text with the daemon's active embedding model.
pub async fn get_embedding(state: &ApiState, text: &str) -> ApiResult<EmbeddingResponse> {
    if text.trim().is_empty() {
        return Err(LocalApiError::ValidationFailed {
            message: "text must not be empty".to_string(),
        });
    }

    let vectors = state.embedder().embed(&[text.to_string()]).await?;
    let vector = vectors.into_iter().next().ok_or_else(|| {
        LocalApiError::Internal {
            message: "embedder returned no vector".to_string(),
        }
    })?;

    Ok(EmbeddingResponse {
        model: state.embedder().model_id().to_string(),
        dimension: vector.len(),
        vector,
    })
}

async fn prepare_search(
    state: &ApiState,
    input: &SearchInput,
) -> ApiResult<(Vec<f32>, f32, usize)> {
    if input.query.trim().is_empty() {
        return Err(LocalApiError::ValidationFailed {
            message: "query must not be empty".to_string(),
        });
    }
    if input.k == 0 || input.k > MAX_K {
        return Err(LocalApiError::ValidationFailed {
            message: format!("k must be between 1 and {MAX_K}"),
        });
    }

    let threshold = input.threshold.unwrap_or(0.0);
    if !(0.0..=1.0).contains(&threshold) {
        return Err(LocalApiError::ValidationFailed {
            message: "threshold must lie in [0, 1]".to_string(),
        });
    }

    let offset = parse_continuation(input.continuation.as_deref())?;

    let vectors = state.embedder().embed(&[input.query.clone()]).await?;
    let query_vector = vectors
        .into_iter()
        .next()
        .ok_or_else(|| LocalApiError::Internal {
            message: "embedder returned no vector".to_string(),
        })?;

    Ok((query_vector, threshold, offset))
}

fn selected_folders(
    state: &ApiState,
    folder: Option<&str>,
) -> ApiResult<Vec<crate::FolderHandle>> {
    match folder {
        Some(path) => Ok(vec![state.folder(path)?]),
        None => Ok(state.folder_handles()),
    }
}

/// Slice `[offset, offset + k)` out of the merged results, stopping early if
/// the token budget runs out. Returns the page, the next offset, and whether
/// the result set was exhausted.
fn budgeted_page<T>(
    merged: Vec<T>,
    offset: usize,
    k: usize,
    cost: impl Fn(&T) -> usize,
) -> (Vec<T>, usize, bool) {
    let total = merged.len();
    let mut page = Vec::new();
    let mut spent = 0usize;
    let mut cursor = offset;

    for entry in merged.into_iter().skip(offset).take(k) {
        let entry_cost = cost(&entry);
        if !page.is_empty() && spent + entry_cost > DEFAULT_TOKEN_BUDGET {
            break;
        }
        spent += entry_cost;
        cursor += 1;
        page.push(entry);
    }

    let exhausted = cursor >= total;
    (page, cursor, exhausted)
}
