use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use loft_core::registry::{CreateOutcome, NewSource};
use loft_core::source::SourceDescriptor;
use loft_core::types::{MediaSource, ScanStrategy};
use loft_core::validator::ValidationResult;

use crate::errors::AppResult;
use crate::state::AppState;

/// Dry-run reachability check. Never persists anything, so failures
/// come back as a structured `ok = false` body, not an error status.
pub async fn validate_source(
    State(state): State<AppState>,
    Json(descriptor): Json<SourceDescriptor>,
) -> Json<ValidationResult> {
    Json(state.registry.validate_only(&descriptor).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSourceRequest {
    #[serde(flatten)]
    pub descriptor: SourceDescriptor,
    pub display_name: Option<String>,
    pub scan_strategy: Option<ScanStrategy>,
    pub scan_interval_seconds: Option<i64>,
    /// Start an initial scan right after creation.
    #[serde(default)]
    pub scan: bool,
}

/// The created (or matched) source, plus whether it already existed.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSourceResponse {
    #[serde(flatten)]
    pub source: MediaSource,
    pub existed: bool,
}

pub async fn create_source(
    State(state): State<AppState>,
    Json(request): Json<CreateSourceRequest>,
) -> AppResult<Response> {
    let outcome = state
        .registry
        .create(NewSource {
            descriptor: request.descriptor,
            display_name: request.display_name,
            scan_strategy: request.scan_strategy,
            scan_interval_seconds: request.scan_interval_seconds,
        })
        .await?;

    let response = match outcome {
        CreateOutcome::Created(source) => {
            if request.scan {
                if let Err(e) = state.engine.trigger(source.id, false).await {
                    warn!(source_id = source.id, error = %e, "initial scan failed to start");
                }
            }
            (
                StatusCode::CREATED,
                Json(CreateSourceResponse {
                    source,
                    existed: false,
                }),
            )
                .into_response()
        }
        CreateOutcome::Existed(source) => (
            StatusCode::OK,
            Json(CreateSourceResponse {
                source,
                existed: true,
            }),
        )
            .into_response(),
        CreateOutcome::Invalid(validation) => {
            (StatusCode::BAD_REQUEST, Json(validation)).into_response()
        }
        CreateOutcome::OverlapParent { parent } => (
            StatusCode::CONFLICT,
            Json(json!({ "conflict": "overlap_parent", "parent": parent })),
        )
            .into_response(),
        CreateOutcome::OverlapChildren { children } => (
            StatusCode::CONFLICT,
            Json(json!({ "conflict": "overlap_children", "children": children })),
        )
            .into_response(),
    };
    Ok(response)
}
