//! HTTP API server.
//!
//! Exposes the question-answering pipeline over JSON HTTP, with answers
//! streamed as server-sent events.
//!
//! # Endpoints
//!
//! | Method   | Path               | Description |
//! |----------|--------------------|-------------|
//! | `POST`   | `/chat`            | Ask a question; answer streams as SSE |
//! | `POST`   | `/documents`       | Upload a document for the session |
//! | `GET`    | `/documents`       | List the session's documents |
//! | `DELETE` | `/documents/{id}`  | Delete one document and its chunks |
//! | `GET`    | `/health`          | Health check (returns version) |
//!
//! # Error Contract
//!
//! All error responses share one schema:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "session_id is required" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `rate_limited` (429),
//! `upstream_error` (502), `index_unavailable` (503), `internal` (500).
//!
//! # Streaming
//!
//! `POST /chat` responds with `text/event-stream`. Each event's data is one
//! JSON object tagged by `type`: first `sources`, then `content` deltas,
//! then `done` or `error`. Closing the connection cancels generation.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! clients.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::PipelineError;
use crate::models::Document;
use crate::orchestrator::{AnswerStream, AskOutcome, Pipeline};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
}

/// Starts the HTTP server on the configured bind address. Runs until the
/// process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pipeline = Arc::new(Pipeline::from_config(config).await?);
    run_server_with_pipeline(&config.server.bind, pipeline).await
}

/// Like [`run_server`], but with an already-constructed pipeline. Useful for
/// embedding the server behind custom wiring.
pub async fn run_server_with_pipeline(
    bind_addr: &str,
    pipeline: Arc<Pipeline>,
) -> anyhow::Result<()> {
    let state = AppState { pipeline };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/chat", post(handle_chat))
        .route("/documents", post(handle_upload).get(handle_list_documents))
        .route("/documents/{doc_id}", delete(handle_delete_document))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    tracing::info!(addr = bind_addr, "server listening");

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    /// Machine-readable error code (e.g., `"bad_request"`, `"rate_limited"`).
    code: String,
    /// Human-readable error message.
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
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

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn rate_limited(retry_after_secs: u64) -> AppError {
    AppError {
        status: StatusCode::TOO_MANY_REQUESTS,
        code: "rate_limited".to_string(),
        message: format!("too many requests; retry in {}s", retry_after_secs),
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidRequest(message) => bad_request(message),
            PipelineError::Index(message) => AppError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                code: "index_unavailable".to_string(),
                message,
            },
            PipelineError::Transient { .. } | PipelineError::Permanent { .. } => AppError {
                status: StatusCode::BAD_GATEWAY,
                code: "upstream_error".to_string(),
                message: err.to_string(),
            },
        }
    }
}

// ============ POST /chat ============

#[derive(Deserialize)]
struct ChatRequest {
    session_id: String,
    /// Conversation thread within the session. Defaults to the session id
    /// for single-thread clients.
    #[serde(default)]
    conversation_id: Option<String>,
    message: String,
    /// Optional allowlist restricting retrieval to specific documents.
    #[serde(default)]
    doc_ids: Option<Vec<String>>,
}

/// Handler for `POST /chat`. Validation and rate limiting happen before the
/// stream opens, so those failures arrive as plain JSON errors; everything
/// after that is delivered in-stream.
async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>, AppError> {
    let conversation_id = req
        .conversation_id
        .clone()
        .unwrap_or_else(|| req.session_id.clone());
    let outcome = state
        .pipeline
        .ask(&req.session_id, &conversation_id, &req.message, req.doc_ids)
        .await?;

    let answer = match outcome {
        AskOutcome::Answer(answer) => answer,
        AskOutcome::RateLimited { retry_after } => {
            return Err(rate_limited(retry_after.as_secs().max(1)));
        }
    };

    // The unfold keeps the AnswerStream alive for the duration of the SSE
    // response; dropping it (client disconnect) aborts generation.
    let stream = futures::stream::unfold(answer, |mut answer: AnswerStream| async move {
        let event = answer.next().await?;
        let sse_event = Event::default()
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().data("{\"type\":\"error\",\"error\":\"serialization failed\"}"));
        Some((Ok::<_, Infallible>(sse_event), answer))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

// ============ POST /documents ============

#[derive(Deserialize)]
struct UploadRequest {
    session_id: String,
    filename: String,
    /// Document content as text.
    content: String,
}

#[derive(Serialize)]
struct UploadResponse {
    doc_id: String,
    /// False when the session already held identical content.
    created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    document: Option<Document>,
}

async fn handle_upload(
    State(state): State<AppState>,
    Json(req): Json<UploadRequest>,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let outcome = state
        .pipeline
        .ingest(&req.session_id, &req.filename, req.content.as_bytes())
        .await?;

    Ok(match outcome {
        crate::models::IngestOutcome::Created(document) => (
            StatusCode::CREATED,
            Json(UploadResponse {
                doc_id: document.doc_id.clone(),
                created: true,
                document: Some(document),
            }),
        ),
        crate::models::IngestOutcome::Duplicate { doc_id } => (
            StatusCode::OK,
            Json(UploadResponse {
                doc_id,
                created: false,
                document: None,
            }),
        ),
    })
}

// ============ GET /documents ============

#[derive(Deserialize)]
struct SessionQuery {
    session_id: String,
}

#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<Document>,
}

async fn handle_list_documents(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<DocumentListResponse>, AppError> {
    let documents = state.pipeline.list_documents(&query.session_id).await?;
    Ok(Json(DocumentListResponse { documents }))
}

// ============ DELETE /documents/{doc_id} ============

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(doc_id): Path<String>,
    Query(query): Query<SessionQuery>,
) -> Result<StatusCode, AppError> {
    let deleted = state
        .pipeline
        .delete_document(&query.session_id, &doc_id)
        .await?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found(format!("document {} not found", doc_id)))
    }
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
