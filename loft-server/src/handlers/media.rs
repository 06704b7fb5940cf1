use std::path::{Path as FsPath, PathBuf};
use std::time::SystemTime;

use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use loft_core::catalog::{ListOrder, ListPage, ListQuery};
use loft_core::thumbs::ThumbOutcome;
use loft_core::types::{MediaRecord, MediaTag};

use crate::errors::{AppError, AppResult};
use crate::state::AppState;

const DEFAULT_PAGE_SIZE: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct MediaListParams {
    #[serde(default)]
    pub offset: i64,
    pub limit: Option<i64>,
    pub tag: Option<MediaTag>,
    pub order: Option<ListOrder>,
    pub seed: Option<String>,
}

pub async fn media_list(
    State(state): State<AppState>,
    Query(params): Query<MediaListParams>,
) -> AppResult<Json<ListPage>> {
    let query = ListQuery {
        offset: params.offset,
        limit: params.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        tag: params.tag,
        order: params.order.unwrap_or_default(),
        seed: params.seed,
    };
    Ok(Json(state.catalog.list(&query).await?))
}

#[derive(Debug, Deserialize)]
pub struct SetTagRequest {
    pub tag: MediaTag,
    pub value: bool,
}

pub async fn set_tag(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<SetTagRequest>,
) -> AppResult<Json<MediaRecord>> {
    if !state.catalog.set_tag(id, request.tag, request.value).await? {
        return Err(AppError::not_found(format!("no media record {id}")));
    }
    state
        .catalog
        .get(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("no media record {id}")))
}

#[derive(Debug, Serialize)]
pub struct SessionSeed {
    pub seed: String,
}

/// Anonymous per-session randomness for the shuffled list order. Not
/// an authentication concept.
pub async fn session_seed() -> Json<SessionSeed> {
    let bytes: [u8; 16] = rand::rng().random();
    Json(SessionSeed {
        seed: bytes.iter().map(|b| format!("{b:02x}")).collect(),
    })
}

/// Serves the cached thumbnail, generating it on first request. If
/// generation fails the original file is served instead; thumbnail
/// trouble is never a client-visible error.
pub async fn thumbnail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let record = state
        .catalog
        .get(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("no media record {id}")))?;
    let original = resolve_original(&state, &record).await?;

    let outcome = state
        .thumbs
        .get_or_generate(record.id, record.media_type, record.thumb_status, &original)
        .await?;
    let (path, etag) = match outcome {
        ThumbOutcome::Thumbnail(path) => (path, format!("\"{}-{}-thumb\"", record.id, record.mtime)),
        ThumbOutcome::Fallback => {
            (original, format!("\"{}-{}-orig\"", record.id, record.mtime))
        }
    };

    if headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == etag)
    {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| AppError::not_found(format!("media file unavailable: {e}")))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|e| AppError::internal(e.to_string()))?;
    let last_modified = httpdate::fmt_http_date(
        metadata.modified().unwrap_or_else(|_| SystemTime::now()),
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type_for(&path))
        .header(header::CONTENT_LENGTH, metadata.len().to_string())
        .header(header::ETAG, etag)
        .header(header::LAST_MODIFIED, last_modified)
        .header(header::CACHE_CONTROL, "private, max-age=86400")
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| AppError::internal(e.to_string()))
}

/// Map a record back to a readable path via its source's backend.
pub(crate) async fn resolve_original(
    state: &AppState,
    record: &MediaRecord,
) -> AppResult<PathBuf> {
    let source = state
        .registry
        .get(record.source_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("no media source {}", record.source_id)))?;
    let backend = state.provider.backend_for(&source)?;
    backend
        .read_path(&record.dedupe_key)
        .ok_or_else(|| AppError::not_found(format!("media {} is outside its source root", record.id)))
}

pub(crate) fn content_type_for(path: &FsPath) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("heic") => "image/heic",
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        Some("avi") => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}
