use super::{HttpResult, IdRequest};
use crate::app::AppState;
use crate::connection::TestOutcome;
use crate::db::models::{Connection, ConnectionDraft};
use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

/// GET /connections
pub async fn list_connections(
    State(state): State<Arc<AppState>>,
) -> HttpResult<Json<Vec<Connection>>> {
    Ok(Json(state.connections.list().await?))
}

/// POST /connections
pub async fn create_connection(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<ConnectionDraft>,
) -> HttpResult<Json<Connection>> {
    Ok(Json(state.connections.create(&draft).await?))
}

/// GET /connections/{id}
pub async fn get_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> HttpResult<Json<Connection>> {
    Ok(Json(state.connections.get(id).await?))
}

/// PUT /connections/{id}. An omitted password keeps the stored one.
pub async fn update_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
    Json(draft): Json<ConnectionDraft>,
) -> HttpResult<Json<Connection>> {
    Ok(Json(state.connections.update(id, &draft).await?))
}

/// POST /connections/delete
pub async fn delete_connection(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IdRequest>,
) -> HttpResult<Json<Value>> {
    let deleted = state.connections.delete(request.id).await?;
    Ok(Json(json!({ "deleted": deleted })))
}

/// POST /connections/test with an unsaved descriptor.
pub async fn test_draft_connection(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<ConnectionDraft>,
) -> HttpResult<Json<TestOutcome>> {
    Ok(Json(state.connections.test_draft(&draft).await?))
}

/// POST /connections/{id}/test
pub async fn test_saved_connection(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> HttpResult<Json<TestOutcome>> {
    Ok(Json(state.connections.test_saved(id).await?))
}
