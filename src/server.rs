//! HTTP adapter.
//!
//! A thin JSON layer over [`Engine`]; every handler calls exactly one engine
//! operation.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/recommend` | Recommend a remedy for a symptom description |
//! | `POST` | `/chat` | Open-ended chat with the active backend |
//! | `GET`  | `/admin/config/llm` | Active backend and available credentials |
//! | `PUT`  | `/admin/config/llm` | Validate and switch the generation backend |
//! | `POST` | `/admin/rebuild-index` | Force a vector index rebuild |
//! | `GET`  | `/health` | Health check (version, rows, index readiness) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "unprocessable", "message": "empty query and the knowledge base has no rows" } }
//! ```
//!
//! Codes come from [`PipelineError::code`], plus `bad_request` (400) for
//! malformed input. The backend switch endpoint keeps its own
//! `{ "status": "error", "message": ... }` shape so front-ends can show the
//! message directly.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted for browser front-ends.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::chat::{ChatRequest, ChatResponse};
use crate::config::Config;
use crate::error::PipelineError;
use crate::models::{RecommendationRequest, RecommendationResponse};
use crate::provider::ProviderId;
use crate::recommend::{Engine, ProviderStatus, RebuildReport};

/// Shared state passed to every handler.
#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

/// Open the engine for `config`, restore its state and serve until killed.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let engine = Arc::new(Engine::open(config.clone())?);
    engine.start().await;
    run_server_with_engine(engine).await
}

/// Serve an already-started engine on `[server].bind`.
pub async fn run_server_with_engine(engine: Arc<Engine>) -> anyhow::Result<()> {
    let bind_addr = engine.config().server.bind.clone();
    let app = build_router(engine);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "remedy server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn build_router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/recommend", post(handle_recommend))
        .route("/chat", post(handle_chat))
        .route(
            "/admin/config/llm",
            get(handle_get_backend).put(handle_set_backend),
        )
        .route("/admin/rebuild-index", post(handle_rebuild_index))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { engine })
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

fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
        PipelineError::ProviderValidation { .. } => StatusCode::BAD_REQUEST,
        PipelineError::ProviderGeneration(_) => StatusCode::BAD_GATEWAY,
        PipelineError::IndexBuild(_) | PipelineError::Persistence(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        AppError {
            status: status_for(&err),
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// ============ POST /recommend ============

async fn handle_recommend(
    State(state): State<AppState>,
    Json(request): Json<RecommendationRequest>,
) -> Result<Json<RecommendationResponse>, AppError> {
    Ok(Json(state.engine.recommend(&request).await?))
}

// ============ POST /chat ============

async fn handle_chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    if request.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }
    Ok(Json(state.engine.chat(&request.message).await))
}

// ============ /admin/config/llm ============

async fn handle_get_backend(State(state): State<AppState>) -> Json<ProviderStatus> {
    Json(state.engine.provider_status().await)
}

#[derive(Deserialize)]
struct SetBackendRequest {
    llm_backend: String,
    #[serde(default)]
    api_key: Option<String>,
}

#[derive(Serialize)]
struct SetBackendResponse {
    status: &'static str,
    message: String,
}

async fn handle_set_backend(
    State(state): State<AppState>,
    Json(request): Json<SetBackendRequest>,
) -> (StatusCode, Json<SetBackendResponse>) {
    let failure = |status: StatusCode, message: String| {
        (
            status,
            Json(SetBackendResponse {
                status: "error",
                message,
            }),
        )
    };

    let id = match request.llm_backend.parse::<ProviderId>() {
        Ok(id) => id,
        Err(message) => return failure(StatusCode::BAD_REQUEST, message),
    };

    match state
        .engine
        .set_provider(id, request.api_key.as_deref())
        .await
    {
        Ok(handle) => (
            StatusCode::OK,
            Json(SetBackendResponse {
                status: "success",
                message: format!(
                    "Backend switched to {} ({})",
                    handle.id,
                    handle.instance.model()
                ),
            }),
        ),
        Err(e) => failure(status_for(&e), e.to_string()),
    }
}

// ============ POST /admin/rebuild-index ============

async fn handle_rebuild_index(
    State(state): State<AppState>,
) -> Result<Json<RebuildReport>, AppError> {
    Ok(Json(state.engine.rebuild_index().await?))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    records: usize,
    index_ready: bool,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        records: state.engine.records().await.len(),
        index_ready: state.engine.index().cached().await.is_some(),
    })
}
