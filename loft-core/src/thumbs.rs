//! On-demand thumbnail generation with a flat JPEG cache keyed by
//! record id. Images are downscaled in-process; video posters come
//! from an ffmpeg binary (system install preferred, sidecar download
//! as fallback). Failures are sticky: a record whose thumbnail cannot
//! be produced is marked `failed` and served as the original instead.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Once};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::catalog::MediaCatalog;
use crate::error::{CoreError, Result};
use crate::types::{MediaType, ThumbStatus};

/// Longest edge of a generated thumbnail, in pixels.
pub const THUMB_MAX_EDGE: u32 = 480;

const JPEG_QUALITY: u8 = 80;

/// What the caller should serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThumbOutcome {
    /// A cached or freshly generated thumbnail at this path.
    Thumbnail(PathBuf),
    /// Generation failed; serve the original file instead.
    Fallback,
}

pub struct ThumbnailService {
    cache_dir: PathBuf,
    catalog: MediaCatalog,
    inflight: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for ThumbnailService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThumbnailService")
            .field("cache_dir", &self.cache_dir)
            .finish_non_exhaustive()
    }
}

impl ThumbnailService {
    pub async fn new(cache_dir: PathBuf, catalog: MediaCatalog) -> Result<Self> {
        tokio::fs::create_dir_all(&cache_dir).await?;
        Ok(Self {
            cache_dir,
            catalog,
            inflight: DashMap::new(),
        })
    }

    pub fn thumb_path(&self, id: Uuid) -> PathBuf {
        self.cache_dir.join(format!("{id}.jpg"))
    }

    /// Return the thumbnail for a record, generating it on first use.
    /// Concurrent requests for the same record share one generation.
    pub async fn get_or_generate(
        &self,
        id: Uuid,
        media_type: MediaType,
        thumb_status: ThumbStatus,
        original: &Path,
    ) -> Result<ThumbOutcome> {
        let thumb = self.thumb_path(id);
        if thumb_status == ThumbStatus::Failed {
            return Ok(ThumbOutcome::Fallback);
        }
        if tokio::fs::try_exists(&thumb).await.unwrap_or(false) {
            return Ok(ThumbOutcome::Thumbnail(thumb));
        }

        let gate = self
            .inflight
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _held = gate.lock().await;

        // A concurrent request may have finished while we waited.
        if tokio::fs::try_exists(&thumb).await.unwrap_or(false) {
            self.inflight.remove(&id);
            return Ok(ThumbOutcome::Thumbnail(thumb));
        }

        let outcome = self.generate(id, media_type, original, &thumb).await;
        self.inflight.remove(&id);
        outcome
    }

    async fn generate(
        &self,
        id: Uuid,
        media_type: MediaType,
        original: &Path,
        thumb: &Path,
    ) -> Result<ThumbOutcome> {
        debug!(%id, original = %original.display(), "generating thumbnail");
        let result = match media_type {
            MediaType::Image => {
                let src = original.to_path_buf();
                let dst = thumb.to_path_buf();
                tokio::task::spawn_blocking(move || image_thumbnail(&src, &dst))
                    .await
                    .map_err(|e| CoreError::Internal(format!("thumbnail task panicked: {e}")))?
            }
            MediaType::Video => {
                let src = original.to_path_buf();
                let dst = thumb.to_path_buf();
                tokio::task::spawn_blocking(move || video_thumbnail(&src, &dst))
                    .await
                    .map_err(|e| CoreError::Internal(format!("thumbnail task panicked: {e}")))?
            }
        };

        match result {
            Ok(()) => {
                self.catalog.set_thumb_status(id, ThumbStatus::Ready).await?;
                Ok(ThumbOutcome::Thumbnail(thumb.to_path_buf()))
            }
            Err(reason) => {
                warn!(%id, original = %original.display(), %reason, "thumbnail generation failed");
                // Leave no partial output behind.
                let _ = tokio::fs::remove_file(thumb).await;
                self.catalog.set_thumb_status(id, ThumbStatus::Failed).await?;
                Ok(ThumbOutcome::Fallback)
            }
        }
    }
}

fn image_thumbnail(src: &Path, dst: &Path) -> std::result::Result<(), String> {
    let img = image::open(src).map_err(|e| format!("decode failed: {e}"))?;
    let thumb = img.thumbnail(THUMB_MAX_EDGE, THUMB_MAX_EDGE).to_rgb8();
    let mut out = std::io::BufWriter::new(
        std::fs::File::create(dst).map_err(|e| format!("create failed: {e}"))?,
    );
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY);
    thumb
        .write_with_encoder(encoder)
        .map_err(|e| format!("encode failed: {e}"))
}

fn video_thumbnail(src: &Path, dst: &Path) -> std::result::Result<(), String> {
    ensure_ffmpeg();
    let seek = probe_duration_secs(src).map_or(1.0, |d| (d * 0.3).max(1.0));
    let status = Command::new(ffmpeg_bin())
        .args(["-v", "error", "-y"])
        .arg("-ss")
        .arg(format!("{seek:.2}"))
        .arg("-i")
        .arg(src)
        .args(["-frames:v", "1"])
        .arg("-vf")
        .arg(format!("scale='min({THUMB_MAX_EDGE},iw)':-2"))
        .arg(dst)
        .status()
        .map_err(|e| format!("could not run ffmpeg: {e}"))?;
    if !status.success() {
        return Err(format!("ffmpeg exited with {status}"));
    }
    if !dst.exists() {
        return Err("ffmpeg produced no output".into());
    }
    Ok(())
}

fn probe_duration_secs(src: &Path) -> Option<f64> {
    let output = Command::new(ffprobe_bin())
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "format=duration",
            "-of",
            "csv=p=0",
        ])
        .arg(src)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

fn ensure_ffmpeg() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        if which("ffmpeg").is_none() {
            if let Err(e) = ffmpeg_sidecar::download::auto_download() {
                warn!(error = %e, "ffmpeg download failed; video thumbnails unavailable");
            }
        }
    });
}

fn ffmpeg_bin() -> PathBuf {
    which("ffmpeg").unwrap_or_else(|| {
        ffmpeg_sidecar::paths::sidecar_dir()
            .map(|d| d.join("ffmpeg"))
            .unwrap_or_else(|_| PathBuf::from("ffmpeg"))
    })
}

fn ffprobe_bin() -> PathBuf {
    which("ffprobe").unwrap_or_else(|| {
        ffmpeg_sidecar::paths::sidecar_dir()
            .map(|d| d.join("ffprobe"))
            .unwrap_or_else(|_| PathBuf::from("ffprobe"))
    })
}

fn which(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn catalog_with_source() -> MediaCatalog {
        let pool = crate::test_pool().await;
        sqlx::query(
            r#"
            INSERT INTO media_sources
                (source_type, root_path, status, scan_strategy, created_at, updated_at)
            VALUES ('local', '/m', 'active', 'manual', ?, ?)
            "#,
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(&pool)
        .await
        .unwrap();
        MediaCatalog::new(pool)
    }

    fn write_test_png(path: &Path, width: u32, height: u32) {
        let img = image::RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        });
        img.save(path).unwrap();
    }

    #[tokio::test]
    async fn image_thumbnail_is_cached_and_downscaled() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("big.png");
        write_test_png(&original, 1600, 900);

        let catalog = catalog_with_source().await;
        catalog
            .upsert(1, "/m/big.png", 100, 1, MediaType::Image)
            .await
            .unwrap();
        let id = catalog
            .list(&Default::default())
            .await
            .unwrap()
            .items
            .remove(0)
            .id;

        let svc = ThumbnailService::new(dir.path().join("thumbs"), catalog.clone())
            .await
            .unwrap();
        let outcome = svc
            .get_or_generate(id, MediaType::Image, ThumbStatus::Pending, &original)
            .await
            .unwrap();
        let ThumbOutcome::Thumbnail(path) = outcome else {
            panic!("expected a thumbnail");
        };
        let thumb = image::open(&path).unwrap();
        assert!(thumb.width() <= THUMB_MAX_EDGE);
        assert!(thumb.height() <= THUMB_MAX_EDGE);

        // Second call serves the cached file.
        let again = svc
            .get_or_generate(id, MediaType::Image, ThumbStatus::Ready, &original)
            .await
            .unwrap();
        assert_eq!(again, ThumbOutcome::Thumbnail(path));
    }

    #[tokio::test]
    async fn undecodable_image_falls_back_and_sticks() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("broken.jpg");
        tokio::fs::write(&original, b"not an image").await.unwrap();

        let catalog = catalog_with_source().await;
        catalog
            .upsert(1, "/m/broken.jpg", 12, 1, MediaType::Image)
            .await
            .unwrap();
        let id = catalog
            .list(&Default::default())
            .await
            .unwrap()
            .items
            .remove(0)
            .id;

        let svc = ThumbnailService::new(dir.path().join("thumbs"), catalog.clone())
            .await
            .unwrap();
        let outcome = svc
            .get_or_generate(id, MediaType::Image, ThumbStatus::Pending, &original)
            .await
            .unwrap();
        assert_eq!(outcome, ThumbOutcome::Fallback);
        assert!(!svc.thumb_path(id).exists());

        // The failure is recorded; later requests skip generation.
        let record = catalog.list(&Default::default()).await.unwrap().items.remove(0);
        assert_eq!(record.thumb_status, ThumbStatus::Failed);
        let again = svc
            .get_or_generate(id, MediaType::Image, record.thumb_status, &original)
            .await
            .unwrap();
        assert_eq!(again, ThumbOutcome::Fallback);
    }
}
