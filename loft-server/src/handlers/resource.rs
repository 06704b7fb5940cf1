//! Raw media streaming with HTTP byte-range support, so video can be
//! seeked without downloading the whole file.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::Response,
};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::errors::{AppError, AppResult};
use crate::handlers::media::{content_type_for, resolve_original};
use crate::state::AppState;

pub async fn media_resource(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let record = state
        .catalog
        .get(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("no media record {id}")))?;
    let path = resolve_original(&state, &record).await?;

    let mut file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| AppError::not_found(format!("media file unavailable: {e}")))?;
    let file_size = file
        .metadata()
        .await
        .map_err(|e| AppError::internal(e.to_string()))?
        .len();
    let content_type = content_type_for(&path);

    if let Some(range) = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_range_header(v, file_size))
    {
        file.seek(std::io::SeekFrom::Start(range.start))
            .await
            .map_err(|e| AppError::internal(format!("seek failed: {e}")))?;
        let content_length = range.end - range.start + 1;
        let mut buffer = vec![0; content_length as usize];
        file.read_exact(&mut buffer)
            .await
            .map_err(|e| AppError::internal(format!("range read failed: {e}")))?;

        return Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_TYPE, content_type)
            .header(header::CONTENT_LENGTH, content_length.to_string())
            .header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", range.start, range.end, file_size),
            )
            .header(header::ACCEPT_RANGES, "bytes")
            .body(Body::from(buffer))
            .map_err(|e| AppError::internal(e.to_string()));
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, file_size.to_string())
        .header(header::ACCEPT_RANGES, "bytes")
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| AppError::internal(e.to_string()))
}

#[derive(Debug, PartialEq, Eq)]
struct ByteRange {
    start: u64,
    end: u64,
}

/// Parse a `bytes=start-end` header. Open-ended (`bytes=100-`) and
/// suffix (`bytes=-100`) forms are both accepted; anything malformed
/// or out of bounds yields `None` and the full file is served.
fn parse_range_header(value: &str, file_size: u64) -> Option<ByteRange> {
    let spec = value.strip_prefix("bytes=")?;
    let (start_str, end_str) = spec.split_once('-')?;
    if file_size == 0 {
        return None;
    }

    let range = if start_str.is_empty() {
        // Suffix form: last N bytes.
        let suffix: u64 = end_str.parse().ok()?;
        if suffix == 0 {
            return None;
        }
        ByteRange {
            start: file_size.saturating_sub(suffix),
            end: file_size - 1,
        }
    } else {
        let start: u64 = start_str.parse().ok()?;
        let end: u64 = if end_str.is_empty() {
            file_size - 1
        } else {
            end_str.parse().ok()?
        };
        ByteRange {
            start,
            end: end.min(file_size - 1),
        }
    };

    (range.start <= range.end && range.end < file_size).then_some(range)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_common_forms() {
        assert_eq!(
            parse_range_header("bytes=0-99", 1000),
            Some(ByteRange { start: 0, end: 99 })
        );
        assert_eq!(
            parse_range_header("bytes=500-", 1000),
            Some(ByteRange {
                start: 500,
                end: 999
            })
        );
        assert_eq!(
            parse_range_header("bytes=-100", 1000),
            Some(ByteRange {
                start: 900,
                end: 999
            })
        );
    }

    #[test]
    fn clamps_and_rejects() {
        // End past EOF is clamped.
        assert_eq!(
            parse_range_header("bytes=0-5000", 1000),
            Some(ByteRange { start: 0, end: 999 })
        );
        assert_eq!(parse_range_header("bytes=1000-1001", 1000), None);
        assert_eq!(parse_range_header("bytes=garbage", 1000), None);
        assert_eq!(parse_range_header("items=0-10", 1000), None);
        assert_eq!(parse_range_header("bytes=0-10", 0), None);
    }
}
