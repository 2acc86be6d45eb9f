//! HTTP route handlers for the job API.

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::Json;
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use provisioner::io::workspace::validate_workspace_id;
use provisioner::orchestrator::WorkspaceSummary;
use provisioner::{JobId, JobSnapshot, ProvisioningRequest};

use crate::error::{ApiError, ApiResult};
use crate::sse;
use crate::state::AppState;

/// Full application: API under `/api`, permissive CORS.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest("/api", api_router())
        .layer(cors)
        .with_state(state)
}

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/jobs", get(list_jobs).post(submit_job))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .route("/jobs/{id}/events", get(sse::job_events))
        .route("/jobs/{id}/log", get(get_job_log))
        .route("/workspaces/{id}", get(get_workspace))
        .route("/workspaces/{id}/outputs", get(get_outputs))
}

pub fn parse_job_id(raw: &str) -> ApiResult<JobId> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid job id {raw:?}")))
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct Submitted {
    job_id: JobId,
}

/// POST /api/jobs - accept a request; the job runs in the background.
async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<ProvisioningRequest>,
) -> ApiResult<(StatusCode, Json<Submitted>)> {
    let job_id = state.orchestrator.submit(request)?;
    info!(job_id = %job_id, "job accepted");
    Ok((StatusCode::ACCEPTED, Json(Submitted { job_id })))
}

#[derive(Deserialize)]
struct JobsQuery {
    workspace: Option<String>,
}

/// GET /api/jobs - newest first, optionally for one workspace.
async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobsQuery>,
) -> Json<Vec<JobSnapshot>> {
    Json(state.orchestrator.list_jobs(query.workspace.as_deref()))
}

/// GET /api/jobs/{id}
async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<JobSnapshot>> {
    let id = parse_job_id(&id)?;
    state
        .orchestrator
        .status(id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("job {id} not found")))
}

/// GET /api/jobs/{id}/log - captured output as plain text; also served for
/// jobs that finished before a restart.
async fn get_job_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<([(header::HeaderName, &'static str); 1], String)> {
    let id = parse_job_id(&id)?;
    match state.orchestrator.job_log(id) {
        Ok(Some(log)) => Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], log)),
        Ok(None) => Err(ApiError::NotFound(format!("no log for job {id}"))),
        Err(err) => Err(ApiError::Internal(format!("{err:#}"))),
    }
}

/// POST /api/jobs/{id}/cancel - accepted means termination has been requested,
/// not that the job is already canceled.
async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let id = parse_job_id(&id)?;
    state.orchestrator.cancel(id)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job_id": id }))))
}

/// GET /api/workspaces/{id} - lock holder and last job per operation.
async fn get_workspace(
    State(state): State<AppState>,
    Path(workspace): Path<String>,
) -> ApiResult<Json<WorkspaceSummary>> {
    Ok(Json(state.orchestrator.workspace_summary(&workspace).await?))
}

/// GET /api/workspaces/{id}/outputs - outputs from the last successful apply.
async fn get_outputs(
    State(state): State<AppState>,
    Path(workspace): Path<String>,
) -> ApiResult<Json<Value>> {
    validate_workspace_id(&workspace)?;
    match state.orchestrator.outputs(&workspace) {
        Ok(Some(outputs)) => Ok(Json(outputs)),
        Ok(None) => Ok(Json(json!({ "message": "no outputs yet" }))),
        Err(err) => Err(ApiError::Internal(format!("{err:#}"))),
    }
}
