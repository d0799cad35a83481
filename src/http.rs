pub mod connections;
pub mod jobs;
pub mod stream;
pub mod trackers;

use crate::app::AppState;
use crate::error::{ApiError, AppError, DatabaseError};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

/// Error returned by handlers, rendered as `{error}` with a mapped status.
#[derive(Debug)]
pub struct HttpError(pub AppError);

impl From<AppError> for HttpError {
    fn from(err: AppError) -> Self {
        HttpError(err)
    }
}

impl From<ApiError> for HttpError {
    fn from(err: ApiError) -> Self {
        HttpError(err.into())
    }
}

impl From<DatabaseError> for HttpError {
    fn from(err: DatabaseError) -> Self {
        HttpError(err.into())
    }
}

impl HttpError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Api(ApiError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub type HttpResult<T> = std::result::Result<T, HttpError>;

/// Body of the delete endpoints.
#[derive(Debug, serde::Deserialize)]
pub struct IdRequest {
    pub id: i32,
}

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "trackersSeq": state.stream.trackers_snapshot().seq,
    }))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/connections",
            get(connections::list_connections).post(connections::create_connection),
        )
        .route("/connections/delete", post(connections::delete_connection))
        .route("/connections/test", post(connections::test_draft_connection))
        .route(
            "/connections/{id}",
            get(connections::get_connection).put(connections::update_connection),
        )
        .route("/connections/{id}/test", post(connections::test_saved_connection))
        .route("/jobs", get(jobs::list_jobs).post(jobs::create_job))
        .route("/jobs/delete", post(jobs::delete_job))
        .route("/jobs/{id}", get(jobs::get_job).put(jobs::update_job))
        .route("/jobs/{id}/run", post(jobs::run_job))
        .route("/jobs/{id}/trackers", get(jobs::job_trackers))
        .route("/jobs/{id}/latest-result/{format}", get(jobs::latest_result))
        .route("/query/preview", post(jobs::preview_query))
        .route("/trackers", get(trackers::trackers_snapshot))
        .route("/trackers/{id}", get(trackers::tracker_detail))
        .route("/trackers/{id}/result/{format}", get(trackers::download_result))
        .route("/stream/{topic}", get(stream::subscribe))
        .with_state(state)
}
