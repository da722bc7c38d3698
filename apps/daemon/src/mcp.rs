use std::sync::Arc;

use local_api::{
    services::{
        self,
        documents::DocRef,
        search::SearchInput,
    },
    ApiState, LocalApiError, LocalApiErrorKind,
};
use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{ServerCapabilities, ServerInfo},
    schemars::{self, JsonSchema},
    tool, tool_handler, tool_router,
    transport::streamable_http_server::{
        session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
    },
    ErrorData as McpError, ServerHandler, ServiceExt,
};
use serde::Deserialize;
use serde_json::json;

#[derive(Clone)]
pub struct FolderMcpServer {
    api: Arc<ApiState>,
    tool_router: ToolRouter<Self>,
}

impl FolderMcpServer {
    pub fn new(api: Arc<ApiState>) -> Self {
        Self {
            api,
            tool_router: Self::tool_router(),
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchToolInput {
    /// Restrict to one registered folder; searches all folders when omitted.
    pub folder: Option<String>,
    pub query: String,
    pub k: usize,
    pub threshold: Option<f32>,
    pub continuation: Option<String>,
}

impl SearchToolInput {
    fn into_service_input(self) -> SearchInput {
        SearchInput {
            folder: self.folder,
            query: self.query,
            k: self.k,
            threshold: self.threshold,
            continuation: self.continuation,
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocToolInput {
    pub folder: String,
    pub path: String,
    pub continuation: Option<String>,
}

impl DocToolInput {
    fn doc_ref(&self) -> DocRef {
        DocRef {
            folder: self.folder.clone(),
            path: self.path.clone(),
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FolderToolInput {
    pub folder: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummaryToolInput {
    pub folder: String,
    pub paths: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingToolInput {
    pub text: String,
}

#[tool_router]
impl FolderMcpServer {
    #[tool(name = "list_folders", description = "List registered folders with status and progress.")]
    async fn list_folders(&self) -> Result<String, McpError> {
        to_json(&services::list_folders(&self.api))
    }

    #[tool(
        name = "list_documents_in_folder",
        description = "List the indexed documents of one folder."
    )]
    async fn list_documents_in_folder(
        &self,
        Parameters(input): Parameters<FolderToolInput>,
    ) -> Result<String, McpError> {
        let documents = services::list_documents_in_folder(&self.api, &input.folder)
            .map_err(api_error_to_mcp)?;
        to_json(&documents)
    }

    #[tool(
        name = "search_docs",
        description = "Semantic document search; returns ranked documents and a continuation token when truncated."
    )]
    async fn search_docs(
        &self,
        Parameters(input): Parameters<SearchToolInput>,
    ) -> Result<String, McpError> {
        let response = services::search_docs(&self.api, input.into_service_input())
            .await
            .map_err(api_error_to_mcp)?;
        to_json(&response)
    }

    #[tool(
        name = "search_chunks",
        description = "Semantic chunk search; returns ranked chunks with offsets and structure."
    )]
    async fn search_chunks(
        &self,
        Parameters(input): Parameters<SearchToolInput>,
    ) -> Result<String, McpError> {
        let response = services::search_chunks(&self.api, input.into_service_input())
            .await
            .map_err(api_error_to_mcp)?;
        to_json(&response)
    }

    #[tool(name = "get_doc_metadata", description = "Metadata and chunk count for one document.")]
    async fn get_doc_metadata(
        &self,
        Parameters(input): Parameters<DocToolInput>,
    ) -> Result<String, McpError> {
        let metadata =
            services::get_doc_metadata(&self.api, &input.doc_ref()).map_err(api_error_to_mcp)?;
        to_json(&metadata)
    }

    #[tool(
        name = "download_doc",
        description = "Document text, budget-truncated with a continuation token."
    )]
    async fn download_doc(
        &self,
        Parameters(input): Parameters<DocToolInput>,
    ) -> Result<String, McpError> {
        let response =
            services::download_doc(&self.api, &input.doc_ref(), input.continuation.as_deref())
                .map_err(api_error_to_mcp)?;
        to_json(&response)
    }

    #[tool(name = "get_chunks", description = "Chunk rows of a document, paged by index.")]
    async fn get_chunks(
        &self,
        Parameters(input): Parameters<DocToolInput>,
    ) -> Result<String, McpError> {
        let response =
            services::get_chunks(&self.api, &input.doc_ref(), input.continuation.as_deref())
                .map_err(api_error_to_mcp)?;
        to_json(&response)
    }

    #[tool(name = "get_doc_summary", description = "Extractive summary of one document.")]
    async fn get_doc_summary(
        &self,
        Parameters(input): Parameters<DocToolInput>,
    ) -> Result<String, McpError> {
        let summary =
            services::get_doc_summary(&self.api, &input.doc_ref()).map_err(api_error_to_mcp)?;
        to_json(&summary)
    }

    #[tool(name = "batch_doc_summary", description = "Extractive summaries for several documents.")]
    async fn batch_doc_summary(
        &self,
        Parameters(input): Parameters<BatchSummaryToolInput>,
    ) -> Result<String, McpError> {
        let summaries = services::batch_doc_summary(&self.api, &input.folder, &input.paths)
            .map_err(api_error_to_mcp)?;
        to_json(&summaries)
    }

    #[tool(
        name = "ingest_status",
        description = "Folder lifecycle snapshot joined with per-folder store statistics."
    )]
    async fn ingest_status(&self) -> Result<String, McpError> {
        let status = services::ingest_status(&self.api).map_err(api_error_to_mcp)?;
        to_json(&status)
    }

    #[tool(name = "refresh_doc", description = "Flag a document for re-indexing.")]
    async fn refresh_doc(
        &self,
        Parameters(input): Parameters<DocToolInput>,
    ) -> Result<String, McpError> {
        services::refresh_doc(&self.api, &input.doc_ref()).map_err(api_error_to_mcp)?;
        to_json(&json!({ "ok": true }))
    }

    #[tool(name = "get_embedding", description = "Embed arbitrary text with the active model.")]
    async fn get_embedding(
        &self,
        Parameters(input): Parameters<EmbeddingToolInput>,
    ) -> Result<String, McpError> {
        let response = services::get_embedding(&self.api, &input.text)
            .await
            .map_err(api_error_to_mcp)?;
        to_json(&response)
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for FolderMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Semantic search over locally indexed document folders: list folders and documents, \
                 search chunks or documents, fetch content and summaries, and inspect ingest status."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

/// The `/mcp` service nested into the local-socket router.
pub fn build_mcp_service(
    api: Arc<ApiState>,
) -> StreamableHttpService<FolderMcpServer, LocalSessionManager> {
    let session_manager = Arc::new(LocalSessionManager::default());

    StreamableHttpService::new(
        move || Ok(FolderMcpServer::new(Arc::clone(&api))),
        session_manager,
        StreamableHttpServerConfig {
            stateful_mode: true,
            sse_keep_alive: None,
            sse_retry: None,
            ..Default::default()
        },
    )
}

/// Serve the tool-call protocol on stdin/stdout until the client hangs up.
pub async fn serve_stdio(api: Arc<ApiState>) -> anyhow::Result<()> {
    let service = FolderMcpServer::new(api)
        .serve(rmcp::transport::stdio())
        .await?;
    service.waiting().await?;
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, McpError> {
    serde_json::to_string_pretty(value)
        .map_err(|error| McpError::internal_error(error.to_string(), None))
}

fn api_error_to_mcp(error: LocalApiError) -> McpError {
    let kind = error.kind();
    let message = error.to_string();
    let data = Some(json!({ "code": error.code() }));

    match kind {
        LocalApiErrorKind::NotFound => McpError::resource_not_found(message, data),
        LocalApiErrorKind::InvalidInput => McpError::invalid_params(message, data),
        LocalApiErrorKind::NotReady => McpError::internal_error(message, data),
        LocalApiErrorKind::Internal => McpError::internal_error(message, data),
    }
}
