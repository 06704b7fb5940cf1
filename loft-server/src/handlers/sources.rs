use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

use loft_core::types::MediaSource;

use crate::errors::{AppError, AppResult};
use crate::state::AppState;

pub async fn list_sources(State(state): State<AppState>) -> AppResult<Json<Vec<MediaSource>>> {
    Ok(Json(state.registry.list().await?))
}

/// Removes the catalog rows only. Files at the root are never touched,
/// and stored credentials stay behind for explicit cleanup. A running
/// scan notices the deletion and aborts itself.
pub async fn delete_source(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> AppResult<StatusCode> {
    if state.registry.delete(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found(format!("no media source with id {id}")))
    }
}
