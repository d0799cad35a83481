use super::HttpResult;
use crate::app::AppState;
use crate::db::models::Tracker;
use crate::error::{ApiError, DatabaseError};
use crate::export::ExportFormat;
use crate::stream::{TrackerDetail, TrackersMessage};
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::sync::Arc;

/// GET /trackers
pub async fn trackers_snapshot(State(state): State<Arc<AppState>>) -> Json<Arc<TrackersMessage>> {
    Json(state.stream.trackers_snapshot())
}

/// GET /trackers/{id}
pub async fn tracker_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> HttpResult<Json<TrackerDetail>> {
    Ok(Json(state.tracker_detail(id).await?))
}

/// GET /trackers/{id}/result/{format}
pub async fn download_result(
    State(state): State<Arc<AppState>>,
    Path((id, format)): Path<(i64, String)>,
) -> HttpResult<Response> {
    let format: ExportFormat = format.parse().map_err(ApiError::InvalidRequest)?;
    state.expire_results().await?;
    let tracker = crate::db::queries::get_tracker(&state.pool, id)
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Tracker {}", id)))?;

    artifact_response(&tracker, format).await
}

/// Streams a tracker's artifact. 404 when it was not requested, is not
/// written yet, or the result has expired.
pub(crate) async fn artifact_response(tracker: &Tracker, format: ExportFormat) -> HttpResult<Response> {
    if !tracker.is_success() {
        return Err(
            ApiError::NotFound(format!("{} result of tracker {}", format, tracker.id)).into(),
        );
    }
    let path = match format {
        ExportFormat::Csv => tracker.csv_path.as_ref(),
        ExportFormat::Xlsx => tracker.xlsx_path.as_ref(),
    }
    .ok_or_else(|| ApiError::NotFound(format!("{} result of tracker {}", format, tracker.id)))?;

    let bytes = tokio::fs::read(path)
        .await
        .map_err(|_| ApiError::NotFound(format!("{} result of tracker {}", format, tracker.id)))?;

    let disposition = format!(
        "attachment; filename=\"result_tid_{}.{}\"",
        tracker.id,
        format.extension()
    );
    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}
