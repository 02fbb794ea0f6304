//! HTTP control surface: status, manual trigger, listings, history

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::backup::{BackupError, BackupOrchestrator};
use crate::config::ServerConfig;
use crate::status::{RunStatus, TriggerSource};

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 500;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Conflict(String),

    /// A provider call failed
    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<BackupError> for ApiError {
    fn from(err: BackupError) -> Self {
        match err {
            BackupError::AlreadyRunning => ApiError::Conflict(err.to_string()),
            BackupError::Fatal(e) => ApiError::Internal(format!("{:#}", e)),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<BackupOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<BackupOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/status", get(get_status))
        .route("/backup", post(trigger_backup))
        .route("/repositories", get(list_repositories))
        .route("/archives", get(list_archives))
        .route("/history", get(list_history))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub fn bind_addr(config: &ServerConfig) -> Result<SocketAddr> {
    format!("{}:{}", config.bind, config.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", config.bind, config.port))
}

/// Serve `app` until `shutdown` resolves
pub async fn serve<F>(addr: SocketAddr, app: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Control surface listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok", "timestamp": Utc::now() }))
}

async fn get_status(State(state): State<AppState>) -> Json<RunStatus> {
    Json((*state.orchestrator.status().snapshot()).clone())
}

async fn trigger_backup(State(state): State<AppState>) -> ApiResult<(StatusCode, Json<Value>)> {
    state.orchestrator.spawn_run(TriggerSource::Manual)?;

    let status = state.orchestrator.status().snapshot();
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": "Backup started", "status": *status })),
    ))
}

async fn list_repositories(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let repositories = state
        .orchestrator
        .lister()
        .list_repositories()
        .await
        .map_err(|e| ApiError::Upstream(format!("{:#}", e)))?;

    Ok(Json(json!({ "count": repositories.len(), "repositories": repositories })))
}

async fn list_archives(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let archives = state
        .orchestrator
        .store()
        .list_archives()
        .await
        .map_err(|e| ApiError::Upstream(format!("{:#}", e)))?;

    Ok(Json(json!({ "count": archives.len(), "archives": archives })))
}

async fn list_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<Value>> {
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).min(MAX_HISTORY_LIMIT);

    let runs = match state.orchestrator.history() {
        Some(history) => history
            .recent_runs(limit)
            .map_err(|e| ApiError::Internal(format!("{:#}", e)))?,
        None => Vec::new(),
    };

    Ok(Json(json!({ "runs": runs })))
}
