//! HTTP server for reminder runs.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::ReminderEngine;
use crate::substrate::{RunId, WorkflowRun};

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub engine: Arc<ReminderEngine>,
}

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub service: String,
    pub status: String,
}

/// Start reminder request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartReminderRequest {
    #[serde(default)]
    pub subscription_id: Option<String>,
}

/// Start reminder response.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartReminderResponse {
    pub run_id: String,
}

/// Run status response.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunStatusResponse {
    pub run_id: String,
    pub subscription_id: String,
    pub status: String,
    pub wake_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub outcome: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<WorkflowRun> for RunStatusResponse {
    fn from(run: WorkflowRun) -> Self {
        Self {
            run_id: run.id.to_string(),
            subscription_id: run.subscription_id,
            status: run.status.as_str().to_string(),
            wake_at: run.wake_at,
            attempts: run.attempts,
            last_error: run.last_error,
            outcome: run.outcome,
            created_at: run.created_at,
            updated_at: run.updated_at,
        }
    }
}

/// Create the HTTP router.
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route(
            "/api/v1/workflows/subscription/reminder",
            post(start_reminder),
        )
        .route("/api/v1/workflows/runs/{run_id}", get(run_status))
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        service: "renewal-reminders".to_string(),
        status: "healthy".to_string(),
    })
}

/// Start a reminder run for a subscription. Returns as soon as the run is
/// queued; reminders are sent later by the runner.
async fn start_reminder(
    State(state): State<HttpState>,
    Json(request): Json<StartReminderRequest>,
) -> Result<(StatusCode, Json<StartReminderResponse>), (StatusCode, String)> {
    let subscription_id = request
        .subscription_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or((
            StatusCode::BAD_REQUEST,
            "subscriptionId is required".to_string(),
        ))?;

    info!(subscription_id, "Starting reminder run");

    let run = state
        .engine
        .trigger(subscription_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok((
        StatusCode::ACCEPTED,
        Json(StartReminderResponse {
            run_id: run.id.to_string(),
        }),
    ))
}

/// Read the persisted state of a run.
async fn run_status(
    State(state): State<HttpState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunStatusResponse>, (StatusCode, String)> {
    let run_id: RunId = run_id
        .parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid run ID".to_string()))?;

    let run = state
        .engine
        .get_run(run_id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or((StatusCode::NOT_FOUND, "Run not found".to_string()))?;

    Ok(Json(run.into()))
}
