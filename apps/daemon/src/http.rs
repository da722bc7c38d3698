use std::{sync::Arc, time::Instant};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use local_api::{
    services::{
        self,
        documents::{DocRef, DocSummary},
        search::SearchInput,
    },
    ApiState, LocalApiError, LocalApiErrorKind,
};
use model_catalog::{Catalog, HostCapabilities, RankedModel, SelectionMode};
use resource_manager::ResourceManager;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;

use crate::mcp::build_mcp_service;

#[derive(Debug, Clone, Copy)]
pub enum ControlMessage {
    Stop { force: bool },
    Reload,
}

#[derive(Clone)]
pub struct HttpState {
    pub api: Arc<ApiState>,
    pub resources: Arc<ResourceManager>,
    pub catalog: Arc<Catalog>,
    pub capabilities: HostCapabilities,
    pub control_tx: Sender<ControlMessage>,
    pub started_at: Instant,
    pub health_check: bool,
    pub performance: bool,
}

pub fn build_router(state: HttpState) -> Router {
    let mcp_service = build_mcp_service(Arc::clone(&state.api));

    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/v1/fmdm", get(fmdm_handler))
        .route("/api/v1/folders", get(folders_handler))
        .route("/api/v1/documents", get(documents_handler))
        .route("/api/v1/search/chunks", post(search_chunks_handler))
        .route("/api/v1/search/docs", post(search_docs_handler))
        .route("/api/v1/docs/metadata", post(doc_metadata_handler))
        .route("/api/v1/docs/download", post(download_handler))
        .route("/api/v1/docs/chunks", post(chunks_handler))
        .route("/api/v1/docs/summary", post(summary_handler))
        .route("/api/v1/docs/summary/batch", post(batch_summary_handler))
        .route("/api/v1/docs/refresh", post(refresh_handler))
        .route("/api/v1/embedding", post(embedding_handler))
        .route("/api/v1/models", get(models_handler))
        .route("/api/v1/status", get(status_handler))
        .route("/api/v1/daemon/stop", post(stop_handler))
        .route("/api/v1/daemon/reload", post(reload_handler))
        .nest_service("/mcp", mcp_service)
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentsQuery {
    folder: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocRequest {
    pub folder: String,
    pub path: String,
    #[serde(default)]
    pub continuation: Option<String>,
}

impl DocRequest {
    fn doc_ref(&self) -> DocRef {
        DocRef {
            folder: self.folder.clone(),
            path: self.path.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchSummaryRequest {
    folder: String,
    paths: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchSummaryResponse {
    summaries: Vec<DocSummary>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmbeddingRequest {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    uptime_secs: u64,
    ingest: services::status::IngestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    performance: Option<PerformanceView>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PerformanceView {
    active_operations: usize,
    queued_operations: usize,
    completed: u64,
    failed: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StopRequest {
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AckResponse {
    ok: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    code: String,
    message: String,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

async fn healthz_handler(State(state): State<HttpState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: if state.health_check { "ok" } else { "disabled" },
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn fmdm_handler(State(state): State<HttpState>) -> Json<fmdm::FolderModelDataMap> {
    Json(state.api.fmdm().get_fmdm())
}

async fn folders_handler(State(state): State<HttpState>) -> Json<Vec<fmdm::FolderView>> {
    Json(services::list_folders(&state.api))
}

async fn documents_handler(
    State(state): State<HttpState>,
    Query(query): Query<DocumentsQuery>,
) -> ApiResult<Vec<services::documents::DocumentView>> {
    services::list_documents_in_folder(&state.api, &query.folder)
        .map(Json)
        .map_err(error_response)
}

async fn search_chunks_handler(
    State(state): State<HttpState>,
    Json(input): Json<SearchInput>,
) -> ApiResult<services::search::SearchResponse<services::search::ChunkSearchEntry>> {
    services::search_chunks(&state.api, input)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn search_docs_handler(
    State(state): State<HttpState>,
    Json(input): Json<SearchInput>,
) -> ApiResult<services::search::SearchResponse<services::search::DocSearchEntry>> {
    services::search_docs(&state.api, input)
        .await
        .map(Json)
        .map_err(error_response)
}

async fn doc_metadata_handler(
    State(state): State<HttpState>,
    Json(request): Json<DocRequest>,
) -> ApiResult<services::documents::DocumentMetadata> {
    services::get_doc_metadata(&state.api, &request.doc_ref())
        .map(Json)
        .map_err(error_response)
}

async fn download_handler(
    State(state): State<HttpState>,
    Json(request): Json<DocRequest>,
) -> ApiResult<services::documents::DownloadResponse> {
    services::download_doc(&state.api, &request.doc_ref(), request.continuation.as_deref())
        .map(Json)
        .map_err(error_response)
}

async fn chunks_handler(
    State(state): State<HttpState>,
    Json(request): Json<DocRequest>,
) -> ApiResult<services::documents::ChunksResponse> {
    services::get_chunks(&state.api, &request.doc_ref(), request.continuation.as_deref())
        .map(Json)
        .map_err(error_response)
}

async fn summary_handler(
    State(state): State<HttpState>,
    Json(request): Json<DocRequest>,
) -> ApiResult<DocSummary> {
    services::get_doc_summary(&state.api, &request.doc_ref())
        .map(Json)
        .map_err(error_response)
}

async fn batch_summary_handler(
    State(state): State<HttpState>,
    Json(request): Json<BatchSummaryRequest>,
) -> ApiResult<BatchSummaryResponse> {
    services::batch_doc_summary(&state.api, &request.folder, &request.paths)
        .map(|summaries| Json(BatchSummaryResponse { summaries }))
        .map_err(error_response)
}

async fn refresh_handler(
    State(state): State<HttpState>,
    Json(request): Json<DocRequest>,
) -> ApiResult<AckResponse> {
    services::refresh_doc(&state.api, &request.doc_ref())
        .map(|()| Json(AckResponse { ok: true }))
        .map_err(error_response)
}

async fn embedding_handler(
    State(state): State<HttpState>,
    Json(request): Json<EmbeddingRequest>,
) -> ApiResult<services::search::EmbeddingResponse> {
    services::get_embedding(&state.api, &request.text)
        .await
        .map(Json)
        .map_err(error_response)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelsQuery {
    /// "assisted" (default) or "manual".
    mode: Option<String>,
    /// Comma-separated ISO language codes weighting the ranking.
    languages: Option<String>,
}

/// Curated models ranked for this host; manual mode appends models served by
/// a detected local inference daemon.
async fn models_handler(
    State(state): State<HttpState>,
    Query(query): Query<ModelsQuery>,
) -> ApiResult<Vec<RankedModel>> {
    let mode = match query.mode.as_deref() {
        None | Some("assisted") => SelectionMode::Assisted,
        Some("manual") => SelectionMode::Manual,
        Some(other) => {
            return Err(error_response(LocalApiError::ValidationFailed {
                message: format!("unknown selection mode '{other}'"),
            }))
        }
    };

    let languages: Vec<String> = query
        .languages
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(|language| language.trim().to_lowercase())
        .filter(|language| !language.is_empty())
        .collect();

    let external = if mode == SelectionMode::Manual {
        model_catalog::discover_ollama_models().await
    } else {
        Vec::new()
    };

    Ok(Json(model_catalog::recommend(
        &state.catalog,
        &state.capabilities,
        mode,
        &languages,
        &external,
    )))
}

async fn status_handler(State(state): State<HttpState>) -> ApiResult<StatusResponse> {
    let ingest = services::ingest_status(&state.api).map_err(error_response)?;

    let performance = state.performance.then(|| {
        let stats = state.resources.stats();
        PerformanceView {
            active_operations: stats.active_operations,
            queued_operations: stats.queued_operations,
            completed: stats.completed,
            failed: stats.failed,
        }
    });

    Ok(Json(StatusResponse {
        uptime_secs: state.started_at.elapsed().as_secs(),
        ingest,
        performance,
    }))
}

async fn stop_handler(
    State(state): State<HttpState>,
    Json(request): Json<StopRequest>,
) -> Json<AckResponse> {
    let _ = state
        .control_tx
        .send(ControlMessage::Stop {
            force: request.force,
        })
        .await;
    Json(AckResponse { ok: true })
}

async fn reload_handler(State(state): State<HttpState>) -> Json<AckResponse> {
    let _ = state.control_tx.send(ControlMessage::Reload).await;
    Json(AckResponse { ok: true })
}

fn error_response(error: LocalApiError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match error.kind() {
        LocalApiErrorKind::NotFound => StatusCode::NOT_FOUND,
        LocalApiErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        LocalApiErrorKind::NotReady => StatusCode::SERVICE_UNAVAILABLE,
        LocalApiErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (
        status,
        Json(ErrorResponse {
            error: ErrorBody {
                code: error.code().to_string(),
                message: error.to_string(),
            },
        }),
    )
}
