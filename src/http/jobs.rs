use super::trackers::artifact_response;
use super::{HttpResult, IdRequest};
use crate::app::AppState;
use crate::db::models::{JobDraft, JobRecord};
use crate::error::{ApiError, DatabaseError};
use crate::export::ExportFormat;
use crate::stream::{QueryResultMessage, TrackerView};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

const DEFAULT_HISTORY_LIMIT: i64 = 50;

pub async fn list_jobs(State(state): State<Arc<AppState>>) -> HttpResult<Json<Vec<JobRecord>>> {
    Ok(Json(state.list_jobs().await?))
}

pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<JobDraft>,
) -> HttpResult<Json<JobRecord>> {
    Ok(Json(state.create_job(&draft).await?))
}

pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> HttpResult<Json<JobRecord>> {
    Ok(Json(state.get_job(id).await?))
}

pub async fn update_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
    Json(draft): Json<JobDraft>,
) -> HttpResult<Json<JobRecord>> {
    Ok(Json(state.update_job(id, &draft).await?))
}

/// POST /jobs/delete
pub async fn delete_job(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IdRequest>,
) -> HttpResult<Json<Value>> {
    state.delete_job(request.id).await?;
    Ok(Json(json!({ "deleted": true })))
}

/// POST /jobs/{id}/run
pub async fn run_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> HttpResult<Json<Value>> {
    let queued = state.run_job_now(id).await?;
    Ok(Json(json!({ "queued": queued })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<i64>,
}

/// GET /jobs/{id}/trackers
pub async fn job_trackers(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
    Query(params): Query<HistoryParams>,
) -> HttpResult<Json<Vec<TrackerView>>> {
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 1000);
    Ok(Json(state.job_history(id, limit).await?))
}

/// GET /jobs/{id}/latest-result/{format}
pub async fn latest_result(
    State(state): State<Arc<AppState>>,
    Path((id, format)): Path<(i32, String)>,
) -> HttpResult<Response> {
    let format: ExportFormat = format.parse().map_err(ApiError::InvalidRequest)?;
    state.jobs.get(id).await?;
    state.expire_results().await?;

    let tracker = crate::db::queries::get_latest_successful_tracker(&state.pool, id)
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Successful run of job {}", id)))?;

    artifact_response(&tracker, format).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRequest {
    pub connection_id: i32,
    pub query: String,
}

/// POST /query/preview
pub async fn preview_query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PreviewRequest>,
) -> HttpResult<Json<QueryResultMessage>> {
    let message = state
        .executor
        .preview(request.connection_id, &request.query)
        .await?;
    Ok(Json(message))
}
