//! Public HTTP API of the orchestrator.
//!
//! - `POST /schedule` accepts a task and starts its sandbox.
//! - `GET /status/{job_id}` reports (and reconciles) a job.
//! - `GET /downloads/{job_id}.tar.gz` serves archived workspaces.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::orchestrator::archive::DOWNLOADS_ROUTE;
use crate::orchestrator::job_manager::JobManager;
use crate::orchestrator::registry::{JobRecord, JobStatus};

/// Shared state for the API handlers.
#[derive(Clone)]
pub struct OrchestratorState {
    pub jobs: Arc<JobManager>,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    #[serde(default)]
    pub prompt: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleResponse {
    pub job_id: Uuid,
    pub port: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub task: String,
    pub workspace: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl From<JobRecord> for StatusResponse {
    fn from(record: JobRecord) -> Self {
        Self {
            job_id: record.id,
            status: record.status,
            task: record.prompt,
            workspace: record.workspace.display().to_string(),
            port: record.port,
            download_url: record.download_url,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = match &self {
            OrchestratorError::NotFound { .. } => StatusCode::NOT_FOUND,
            OrchestratorError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// The orchestrator's public API server.
pub struct OrchestratorApi;

impl OrchestratorApi {
    /// Build the axum router.
    pub fn router(state: OrchestratorState) -> Router {
        let downloads = ServeDir::new(state.jobs.downloads_dir());
        Router::new()
            .route("/schedule", post(schedule))
            .route("/status/{job_id}", get(job_status))
            .route("/health", get(health_check))
            .nest_service(DOWNLOADS_ROUTE, downloads)
            .layer(CatchPanicLayer::new())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve the API on `addr` until `shutdown` is cancelled.
    pub async fn start(
        state: OrchestratorState,
        addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(), std::io::Error> {
        let router = Self::router(state);
        let listener = tokio::net::TcpListener::bind(addr).await?;

        tracing::info!("Orchestrator API listening on {}", listener.local_addr()?);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                tracing::info!("Orchestrator API shutting down");
            })
            .await
    }
}

// -- Handlers --

async fn health_check() -> &'static str {
    "ok"
}

async fn schedule(
    State(state): State<OrchestratorState>,
    Json(req): Json<ScheduleRequest>,
) -> Result<Json<ScheduleResponse>, OrchestratorError> {
    let job = state.jobs.schedule(&req.prompt).await?;
    Ok(Json(ScheduleResponse {
        job_id: job.job_id,
        port: job.port,
    }))
}

async fn job_status(
    State(state): State<OrchestratorState>,
    Path(job_id): Path<String>,
) -> Result<Json<StatusResponse>, OrchestratorError> {
    let record = state.jobs.status(&job_id).await?;
    Ok(Json(record.into()))
}
