//! HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/upload/text` | Ingest pasted text |
//! | `POST` | `/api/upload/document` | Ingest a PDF (multipart `file` + `assistantId`) |
//! | `POST` | `/api/upload/website` | Fetch and ingest a web page |
//! | `POST` | `/api/chat` | Answer a question in one response |
//! | `POST` | `/api/chat/stream` | Answer as `text/event-stream` |
//! | `POST` | `/api/session` | Open a chat session |
//! | `GET`  | `/api/assistants` | Assistants with their completed documents |
//! | `GET`  | `/api/assistants/{id}/chats` | Sessions of an assistant |
//! | `GET`  | `/api/assistants/{id}/documents` | Documents of an assistant, newest first |
//! | `GET`  | `/api/sessions/{id}/messages` | Messages of a session, oldest first |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "assistantId is required" } }
//! ```
//!
//! Error codes: `bad_request`, `not_found`, `no_content` (400);
//! `rate_limited`, `upstream_error`, `internal` (500).
//!
//! `/api/chat/stream` never answers with an error status once the stream has
//! started; failures arrive as the terminal event.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser clients can
//! call the API directly.

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::embedding::{create_provider, BatchEmbedder};
use crate::error::Error;
use crate::generation::OpenAIChatGenerator;
use crate::index::create_index;
use crate::ingest::{IngestOutcome, IngestRequest, IngestionPipeline};
use crate::loader::{
    validate_pdf_upload, PdfLoader, WebPageLoader, HTML_MIME, MIN_WEBSITE_CHARS, PDF_MIME,
};
use crate::models::{AssistantOverview, Document, Message, RetrievedPassage, SessionSummary, SourceKind};
use crate::query::QueryEngine;
use crate::store::{SqliteStore, Store};
use crate::transport::event_stream_body;
use crate::{db, migrate};

const DEFAULT_TEXT_FILE_NAME: &str = "pasted-text";
const WEBSITE_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    store: Arc<dyn Store>,
    pipeline: Arc<IngestionPipeline>,
    engine: Arc<QueryEngine>,
    http: reqwest::Client,
    max_upload_bytes: usize,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        pipeline: Arc<IngestionPipeline>,
        engine: Arc<QueryEngine>,
        http: reqwest::Client,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            store,
            pipeline,
            engine,
            http,
            max_upload_bytes,
        }
    }

    /// Wire every component from configuration: database (migrated and
    /// seeded), embedding provider, vector index and generator.
    pub async fn build(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool));
        migrate::seed_assistants(store.as_ref(), &config.assistants).await?;

        let provider = create_provider(&config.embedding)?;
        let embedder = Arc::new(BatchEmbedder::from_config(provider, &config.embedding));
        let index = create_index(&config.index).await?;
        let generator = Arc::new(OpenAIChatGenerator::from_config(&config.generation)?);

        let pipeline = Arc::new(IngestionPipeline::new(
            store.clone(),
            embedder.clone(),
            index.clone(),
            config.chunking.clone(),
        ));
        let engine = Arc::new(
            QueryEngine::new(store.clone(), embedder, index, generator)
                .with_top_k(config.retrieval.top_k),
        );
        let http = reqwest::Client::builder()
            .timeout(WEBSITE_FETCH_TIMEOUT)
            .user_agent(concat!("docent/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self::new(
            store,
            pipeline,
            engine,
            http,
            config.server.max_upload_bytes,
        ))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn pipeline(&self) -> &Arc<IngestionPipeline> {
        &self.pipeline
    }

    pub fn engine(&self) -> &Arc<QueryEngine> {
        &self.engine
    }

    /// Validate and ingest an uploaded PDF. A rejected upload creates no
    /// document record.
    pub async fn ingest_pdf(
        &self,
        assistant_id: &str,
        file_name: String,
        content_type: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<IngestOutcome, Error> {
        validate_pdf_upload(content_type, &bytes, self.max_upload_bytes)?;
        let request = IngestRequest::new(assistant_id, file_name, SourceKind::Pdf)
            .with_mime_type(PDF_MIME)
            .with_file_size(bytes.len() as i64);
        self.pipeline
            .ingest_from_loader(&PdfLoader::new(bytes), request)
            .await
    }

    /// Fetch and ingest a web page. The document is named `title`, else the
    /// page title, else the URL. Returns the outcome and that name.
    pub async fn ingest_website(
        &self,
        assistant_id: &str,
        url: &str,
        title: Option<&str>,
    ) -> Result<(IngestOutcome, String), Error> {
        let page = WebPageLoader::new(self.http.clone(), url)?.fetch().await?;
        let chars = page.char_len();
        if chars < MIN_WEBSITE_CHARS {
            return Err(Error::invalid(format!(
                "website has too little text ({} characters, need at least {})",
                chars, MIN_WEBSITE_CHARS
            )));
        }

        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .or_else(|| page.title.clone())
            .unwrap_or_else(|| url.to_string());
        let request = IngestRequest::new(assistant_id, title.clone(), SourceKind::Website)
            .with_source_url(page.url.clone())
            .with_mime_type(HTML_MIME)
            .with_file_size(chars as i64);
        let outcome = self.pipeline.ingest_from_loader(&page, request).await?;
        Ok((outcome, title))
    }
}

/// Builds the router with all routes and layers.
///
/// The body limit sits well above `max_upload_bytes` so oversized PDFs reach
/// the upload handler and are rejected there with the usual error body.
pub fn router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes.saturating_mul(2) + 1024 * 1024;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/upload/text", post(handle_upload_text))
        .route("/api/upload/document", post(handle_upload_document))
        .route("/api/upload/website", post(handle_upload_website))
        .route("/api/chat", post(handle_chat))
        .route("/api/chat/stream", post(handle_chat_stream))
        .route("/api/session", post(handle_create_session))
        .route("/api/assistants", get(handle_list_assistants))
        .route("/api/assistants/{id}/chats", get(handle_list_chats))
        .route("/api/assistants/{id}/documents", get(handle_list_documents))
        .route("/api/sessions/{id}/messages", get(handle_list_messages))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve on an already bound listener until the process is terminated.
pub async fn serve(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Starts the HTTP server on `[server].bind`.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = AppState::build(config).await?;
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "docent server listening");
    serve(listener, state).await
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let (status, code) = match &err {
            Error::NotFound(_) => (StatusCode::BAD_REQUEST, "not_found"),
            Error::InvalidInput(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Error::NoContent(_) => (StatusCode::BAD_REQUEST, "no_content"),
            Error::UpstreamRateLimited(_) => (StatusCode::INTERNAL_SERVER_ERROR, "rate_limited"),
            Error::UpstreamFailure(_) => (StatusCode::INTERNAL_SERVER_ERROR, "upstream_error"),
            Error::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        if status.is_server_error() {
            warn!(code, error = %err, "request failed");
        }
        AppError {
            status,
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

/// The trimmed value of a required string field.
fn required(value: Option<String>, field: &str) -> Result<String, AppError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| bad_request(format!("{} is required", field)))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Uploads ============

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    success: bool,
    document_id: String,
    chunks_created: usize,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    extracted_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
}

impl UploadResponse {
    fn new(outcome: IngestOutcome, what: &str) -> Self {
        Self {
            success: true,
            message: format!(
                "{} processed successfully: {} chunks created",
                what, outcome.chunks_created
            ),
            document_id: outcome.document_id,
            chunks_created: outcome.chunks_created,
            extracted_length: None,
            title: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadTextRequest {
    text: Option<String>,
    assistant_id: Option<String>,
    file_name: Option<String>,
    source_url: Option<String>,
}

async fn handle_upload_text(
    State(state): State<AppState>,
    body: Result<Json<UploadTextRequest>, JsonRejection>,
) -> Result<Json<UploadResponse>, AppError> {
    let Json(req) = body?;
    let text = required(req.text, "text")?;
    let assistant_id = required(req.assistant_id, "assistantId")?;
    let file_name = req
        .file_name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_TEXT_FILE_NAME.to_string());
    let source_url = req.source_url.filter(|u| !u.trim().is_empty());

    let kind = if source_url.is_some() {
        SourceKind::Website
    } else {
        SourceKind::Text
    };
    let mut request = IngestRequest::new(assistant_id, file_name, kind)
        .with_mime_type("text/plain")
        .with_file_size(text.len() as i64);
    if let Some(url) = source_url {
        request = request.with_source_url(url);
    }

    let outcome = state.pipeline.ingest_text(&text, request).await?;
    Ok(Json(UploadResponse::new(outcome, "Text")))
}

async fn handle_upload_document(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let mut file: Option<(String, Option<String>, Vec<u8>)> = None;
    let mut assistant_id = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(e.body_text()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let file_name = field.file_name().unwrap_or("document.pdf").to_string();
                let content_type = field.content_type().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(e.body_text()))?;
                file = Some((file_name, content_type, bytes.to_vec()));
            }
            Some("assistantId") => {
                assistant_id = Some(field.text().await.map_err(|e| bad_request(e.body_text()))?);
            }
            _ => {}
        }
    }

    let assistant_id = required(assistant_id, "assistantId")?;
    let (file_name, content_type, bytes) = file.ok_or_else(|| bad_request("file is required"))?;
    let outcome = state
        .ingest_pdf(&assistant_id, file_name, content_type.as_deref(), bytes)
        .await?;

    let extracted = outcome.extracted_chars;
    let mut response = UploadResponse::new(outcome, "Document");
    response.extracted_length = Some(extracted);
    Ok(Json(response))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadWebsiteRequest {
    url: Option<String>,
    assistant_id: Option<String>,
    title: Option<String>,
}

async fn handle_upload_website(
    State(state): State<AppState>,
    body: Result<Json<UploadWebsiteRequest>, JsonRejection>,
) -> Result<Json<UploadResponse>, AppError> {
    let Json(req) = body?;
    let url = required(req.url, "url")?;
    let assistant_id = required(req.assistant_id, "assistantId")?;

    let (outcome, title) = state
        .ingest_website(&assistant_id, &url, req.title.as_deref())
        .await?;

    let extracted = outcome.extracted_chars;
    let mut response = UploadResponse::new(outcome, "Website");
    response.extracted_length = Some(extracted);
    response.title = Some(title);
    Ok(Json(response))
}

// ============ Chat ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    message: Option<String>,
    assistant_id: Option<String>,
    session_id: Option<String>,
}

struct ChatInput {
    message: String,
    assistant_id: String,
    session_id: Option<String>,
}

impl TryFrom<ChatRequest> for ChatInput {
    type Error = AppError;

    fn try_from(req: ChatRequest) -> Result<Self, AppError> {
        Ok(Self {
            message: required(req.message, "message")?,
            assistant_id: required(req.assistant_id, "assistantId")?,
            session_id: req.session_id.filter(|s| !s.trim().is_empty()),
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatResponse {
    response: String,
    retrieved_passages: Vec<RetrievedPassage>,
    session_id: Option<String>,
}

async fn handle_chat(
    State(state): State<AppState>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, AppError> {
    let Json(req) = body?;
    let input = ChatInput::try_from(req)?;
    let answer = state
        .engine
        .answer(&input.message, &input.assistant_id, input.session_id.as_deref())
        .await?;
    Ok(Json(ChatResponse {
        response: answer.response,
        retrieved_passages: answer.retrieved_passages,
        session_id: input.session_id,
    }))
}

async fn handle_chat_stream(
    State(state): State<AppState>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(req) = body?;
    let input = ChatInput::try_from(req)?;
    let events = state
        .engine
        .answer_stream(input.message, input.assistant_id, input.session_id);
    Ok(event_stream_body(events))
}

// ============ Sessions ============

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionRequest {
    assistant_id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    success: bool,
    session_id: String,
}

async fn handle_create_session(
    State(state): State<AppState>,
    body: Result<Json<SessionRequest>, JsonRejection>,
) -> Result<Json<SessionResponse>, AppError> {
    let Json(req) = body?;
    let assistant_id = required(req.assistant_id, "assistantId")?;
    let session_id = state.engine.create_session(&assistant_id).await?;
    Ok(Json(SessionResponse {
        success: true,
        session_id,
    }))
}

// ============ Listings ============

#[derive(Serialize)]
struct AssistantsResponse {
    assistants: Vec<AssistantOverview>,
}

async fn handle_list_assistants(
    State(state): State<AppState>,
) -> Result<Json<AssistantsResponse>, AppError> {
    let assistants = state.store.assistant_overviews().await?;
    Ok(Json(AssistantsResponse { assistants }))
}

#[derive(Serialize)]
struct ChatsResponse {
    chats: Vec<SessionSummary>,
}

async fn handle_list_chats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ChatsResponse>, AppError> {
    let chats = state.engine.list_sessions(&id).await?;
    Ok(Json(ChatsResponse { chats }))
}

#[derive(Serialize)]
struct DocumentsResponse {
    documents: Vec<Document>,
}

async fn handle_list_documents(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DocumentsResponse>, AppError> {
    if state.store.get_assistant(&id).await?.is_none() {
        return Err(Error::not_found(format!("assistant {}", id)).into());
    }
    let documents = state.store.list_documents(&id).await?;
    Ok(Json(DocumentsResponse { documents }))
}

#[derive(Serialize)]
struct MessagesResponse {
    messages: Vec<Message>,
}

async fn handle_list_messages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<MessagesResponse>, AppError> {
    let messages = state.engine.session_messages(&id).await?;
    Ok(Json(MessagesResponse { messages }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::not_found("assistant x"), 400, "not_found"),
            (Error::invalid("bad"), 400, "bad_request"),
            (Error::NoContent("empty".into()), 400, "no_content"),
            (Error::UpstreamRateLimited("429".into()), 500, "rate_limited"),
            (Error::upstream("boom"), 500, "upstream_error"),
            (Error::Storage(sqlx::Error::RowNotFound), 500, "internal"),
        ];
        for (err, status, code) in cases {
            let app: AppError = err.into();
            assert_eq!(app.status.as_u16(), status, "{}", code);
            assert_eq!(app.code, code);
        }
    }

    #[test]
    fn test_required_trims_and_rejects_blank() {
        assert_eq!(required(Some("  x ".into()), "f").ok(), Some("x".to_string()));
        let err = required(Some("   ".into()), "assistantId").err().unwrap();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("assistantId"));
        assert!(required(None, "text").is_err());
    }

    #[test]
    fn test_upload_message() {
        let outcome = IngestOutcome {
            document_id: "d1".into(),
            chunks_created: 3,
            extracted_chars: 120,
        };
        let response = UploadResponse::new(outcome, "Text");
        assert_eq!(response.message, "Text processed successfully: 3 chunks created");
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["documentId"], "d1");
        assert_eq!(json["chunksCreated"], 3);
        assert!(json.get("extractedLength").is_none());
    }
}
