use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use loft_core::types::ScanJob;

use crate::errors::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StartScanParams {
    pub source_id: i64,
    /// Also drop records whose files vanished from the source. Only
    /// honored when the walk finishes successfully.
    #[serde(default)]
    pub purge_missing: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartScanResponse {
    pub job_id: Uuid,
    /// True when the request attached to an already-running job.
    pub coalesced: bool,
}

/// Accept-and-poll: the walk runs in the background, the caller gets a
/// job id back immediately.
pub async fn start_scan(
    State(state): State<AppState>,
    Query(params): Query<StartScanParams>,
) -> AppResult<(StatusCode, Json<StartScanResponse>)> {
    let outcome = state
        .engine
        .trigger(params.source_id, params.purge_missing)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartScanResponse {
            job_id: outcome.job.job_id,
            coalesced: outcome.coalesced,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ScanStatusParams {
    pub job_id: Uuid,
}

pub async fn scan_status(
    State(state): State<AppState>,
    Query(params): Query<ScanStatusParams>,
) -> AppResult<Json<ScanJob>> {
    state
        .engine
        .status(params.job_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("no scan job {}", params.job_id)))
}
