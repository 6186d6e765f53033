//! Axum HTTP surface over the [`Engine`].
//!
//! - Request body limit (64KB)
//! - Request timeout above the worst-case deep path (two attempts)
//! - JSON errors carrying the engine's stable error code

use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use uuid::Uuid;

use crate::directive::Disposition;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::knowledge::Document;

/// Maximum request body size (64KB).
pub const MAX_BODY_SIZE: usize = 65_536;
/// Slack on top of two deep attempts before the server gives up.
const REQUEST_TIMEOUT_SLACK_SECS: u64 = 30;
const DEFAULT_HISTORY_LIMIT: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Request timeout for a given deep-path timeout.
pub fn request_timeout(deep_timeout_secs: u64) -> Duration {
    Duration::from_secs(deep_timeout_secs.saturating_mul(2) + REQUEST_TIMEOUT_SLACK_SECS)
}

pub fn router(engine: Arc<Engine>) -> Router {
    let timeout = request_timeout(engine.config().router.deep_timeout_secs);
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/directives", post(handle_submit_directive))
        .route("/api/directives/{id}/disposition", post(handle_disposition))
        .route("/api/instructions", get(handle_list_instructions))
        .route("/api/instructions/active", get(handle_active_instructions))
        .route("/api/instructions/{version}", get(handle_get_instructions))
        .route("/api/instructions/{version}/activate", post(handle_activate_instructions))
        .route("/api/evolution/cycles", post(handle_trigger_cycle))
        .route("/api/evolution/cycles", get(handle_cycle_history))
        .route("/api/knowledge/documents", post(handle_ingest))
        .with_state(AppState { engine })
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, timeout))
}

/// Serve until `token` is cancelled.
pub async fn run_server(engine: Arc<Engine>, token: CancellationToken) -> Result<()> {
    let host = engine.config().server.host.clone();
    let port = engine.config().server.port;
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    tracing::info!(addr = %local, "HTTP server listening");

    let app = router(engine);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;
    tracing::info!("HTTP server stopped");
    Ok(())
}

// ── Errors ───────────────────────────────────────────────────────

pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "bad_request",
            message: message.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        let status = match &e {
            EngineError::EmptyDirective => StatusCode::BAD_REQUEST,
            EngineError::UnknownDirective(_) | EngineError::UnknownVersion(_) => StatusCode::NOT_FOUND,
            EngineError::DispositionFinal(_) | EngineError::DispositionWindowClosed(_) => {
                StatusCode::CONFLICT
            }
            EngineError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(code = e.code(), error = %e, "Request failed");
        }
        Self {
            status,
            code: e.code(),
            message: e.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self::bad_request(format!("Invalid JSON body: {}", e.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message, "code": self.code });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ══════════════════════════════════════════════════════════════════
// HANDLERS
// ══════════════════════════════════════════════════════════════════

/// GET /health
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "gateway": state.engine.gateway_name(),
        "gateway_available": state.engine.gateway_available().await,
        "instructions_version": state.engine.active_instructions_version().version,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DirectiveBody {
    pub text: String,
}

/// POST /api/directives: route a directive and return the result.
async fn handle_submit_directive(
    State(state): State<AppState>,
    body: std::result::Result<Json<DirectiveBody>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(body) = body?;
    let result = state.engine.submit_directive(&body.text).await?;
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct DispositionBody {
    pub disposition: Disposition,
    #[serde(default)]
    pub note: Option<String>,
}

/// POST /api/directives/{id}/disposition: the user accepted or edited a result.
async fn handle_disposition(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: std::result::Result<Json<DispositionBody>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(body) = body?;
    if !body.disposition.is_terminal() {
        return Err(ApiError::bad_request("disposition must be accepted or rejected"));
    }
    state
        .engine
        .update_disposition(id, body.disposition, body.note)
        .await?;
    Ok(Json(serde_json::json!({
        "directive_id": id,
        "disposition": body.disposition,
    })))
}

/// GET /api/instructions
async fn handle_list_instructions(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.list_instructions().await?))
}

/// GET /api/instructions/active: metadata plus content of the active version.
async fn handle_active_instructions(State(state): State<AppState>) -> impl IntoResponse {
    let meta = state.engine.active_instructions_version();
    let doc = state.engine.active_instructions();
    Json(serde_json::json!({
        "meta": meta,
        "content": doc.content,
    }))
}

/// GET /api/instructions/{version}
async fn handle_get_instructions(
    State(state): State<AppState>,
    Path(version): Path<u64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.get_instructions(version).await?))
}

/// POST /api/instructions/{version}/activate: rollback or roll-forward.
async fn handle_activate_instructions(
    State(state): State<AppState>,
    Path(version): Path<u64>,
) -> ApiResult<impl IntoResponse> {
    let doc = state.engine.activate_instructions(version).await?;
    Ok(Json(serde_json::json!({ "active_version": doc.version })))
}

/// POST /api/evolution/cycles: run a cycle now.
async fn handle_trigger_cycle(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.engine.trigger_evolution_cycle().await?))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// GET /api/evolution/cycles?limit=N
async fn handle_cycle_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<impl IntoResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 500);
    Ok(Json(state.engine.evolution_history(limit).await?))
}

/// POST /api/knowledge/documents: called by the document watcher.
async fn handle_ingest(
    State(state): State<AppState>,
    body: std::result::Result<Json<Document>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(document) = body?;
    if document.id.trim().is_empty() {
        return Err(ApiError::bad_request("document id must not be empty"));
    }
    let id = document.id.clone();
    let revision = state.engine.ingest(document).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": id, "revision": revision })),
    ))
}
