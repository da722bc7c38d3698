pub mod documents;
pub mod search;
pub mod status;

#[cfg(test)]
pub(crate) mod test_support;

pub use documents::{
    batch_doc_summary, download_doc, get_chunks, get_doc_metadata, get_doc_summary,
    list_documents_in_folder, refresh_doc,
};
pub use search::{get_embedding, search_chunks, search_docs};
pub use status::{ingest_status, list_folders};

/// Rough token accounting for response budgeting. Four characters per token
/// is the usual flat estimate for English prose; being off by a little only
/// moves where the continuation cut lands.
pub(crate) const DEFAULT_TOKEN_BUDGET: usize = 2000;
pub(crate) const CHARS_PER_TOKEN: usize = 4;

pub(crate) fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

pub(crate) fn parse_continuation(token: Option<&str>) -> Result<usize, crate::LocalApiError> {
    match token {
        None => Ok(0),
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| crate::LocalApiError::ValidationFailed {
                message: format!("invalid continuation token '{raw}'"),
            }),
    }
}

pub(crate) fn continuation_for(next_offset: usize, exhausted: bool) -> Option<String> {
    if exhausted {
        None
    } else {
        Some(next_offset.to_string())
    }
}
