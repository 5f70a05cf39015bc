//! HTTP API over the orchestrator.
//!
//! | Route | Method | Purpose |
//! |-------|--------|---------|
//! | `/health` | GET | liveness probe |
//! | `/insights/{id}` | GET | fetch one record from the source |
//! | `/insights/{id}` | DELETE | tombstone a record and converge the index |
//! | `/search` | POST | semantic search with optional summary |
//! | `/sync` | POST | start a background sync, returns `202` + job id |
//! | `/jobs/{id}` | GET | poll a background sync job |
//!
//! Errors follow one JSON shape: `{"error": {"code", "message"}}`.

use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::jobs::JobRecord;
use crate::models::{InsightRecord, RecordId, SearchQuery, SearchResponse, SyncReport, SyncScope};
use crate::service::Orchestrator;

pub async fn run(service: Arc<Orchestrator>, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {bind}"))?;
    tracing::info!(addr = %listener.local_addr()?, "HTTP server listening");
    axum::serve(listener, router(service)).await?;
    Ok(())
}

pub fn router(service: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/insights/{id}", get(fetch_insight).delete(delete_insight))
        .route("/search", post(search))
        .route("/sync", post(start_sync))
        .route("/jobs/{id}", get(get_job))
        .layer(CorsLayer::permissive())
        .with_state(service)
}

// ============ Error mapping ============

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let (status, code) = match &err {
            PipelineError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            PipelineError::Transient { .. } => (StatusCode::SERVICE_UNAVAILABLE, "transient"),
            PipelineError::PermanentRecord { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "permanent_record")
            }
            PipelineError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        };
        Self {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code,
                "message": self.message,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

fn job_not_found(id: Uuid) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: format!("job {id} not found (it may have been evicted)"),
    }
}

// ============ Requests ============

/// Body of `POST /sync`.
#[derive(Debug, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SyncRequest {
    All,
    Since { since: DateTime<Utc> },
    One { id: RecordId },
}

impl From<SyncRequest> for SyncScope {
    fn from(request: SyncRequest) -> Self {
        match request {
            SyncRequest::All => SyncScope::All,
            SyncRequest::Since { since } => SyncScope::Since(since),
            SyncRequest::One { id } => SyncScope::One(id),
        }
    }
}

// ============ Handlers ============

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn fetch_insight(
    State(service): State<Arc<Orchestrator>>,
    Path(id): Path<RecordId>,
) -> Result<Json<InsightRecord>, AppError> {
    Ok(Json(service.fetch(id).await?))
}

async fn delete_insight(
    State(service): State<Arc<Orchestrator>>,
    Path(id): Path<RecordId>,
) -> Result<Json<SyncReport>, AppError> {
    Ok(Json(service.delete(id).await?))
}

async fn search(
    State(service): State<Arc<Orchestrator>>,
    Json(query): Json<SearchQuery>,
) -> Result<Json<SearchResponse>, AppError> {
    Ok(Json(service.search(&query).await?))
}

async fn start_sync(
    State(service): State<Arc<Orchestrator>>,
    Json(request): Json<SyncRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let job_id = service.start_sync_job(request.into());
    (StatusCode::ACCEPTED, Json(json!({"job_id": job_id})))
}

async fn get_job(
    State(service): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobRecord>, AppError> {
    service
        .jobs()
        .get(id)
        .map(Json)
        .ok_or_else(|| job_not_found(id))
}
