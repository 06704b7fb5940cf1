//! Domain types shared by the registry, scan engine and catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of storage backing a configured source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SourceType {
    Local,
    Smb,
    /// Declared for forward compatibility; validation rejects it.
    Webdav,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Local => "local",
            SourceType::Smb => "smb",
            SourceType::Webdav => "webdav",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SourceStatus {
    Active,
    Inactive,
}

/// How scans for a source get triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ScanStrategy {
    Realtime,
    Scheduled,
    Manual,
    Disabled,
}

impl ScanStrategy {
    /// Default strategy for a source type: watch local roots, poll
    /// network shares on a schedule.
    pub fn default_for(source_type: SourceType) -> Self {
        match source_type {
            SourceType::Local => ScanStrategy::Realtime,
            _ => ScanStrategy::Scheduled,
        }
    }
}

/// Default interval for `scheduled` sources when none is given.
pub const DEFAULT_SCAN_INTERVAL_SECS: i64 = 3600;

/// A configured media root. Credentials never live here; see
/// [`crate::credentials::CredentialStore`].
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MediaSource {
    pub id: i64,
    pub source_type: SourceType,
    pub display_name: Option<String>,
    /// Canonical root: absolute path for local sources, a
    /// credential-free `smb://[user@]host/share[/subpath]` URL for SMB.
    pub root_path: String,
    pub status: SourceStatus,
    pub scan_strategy: ScanStrategy,
    pub scan_interval_seconds: Option<i64>,
    pub last_scan_started_at: Option<DateTime<Utc>>,
    pub last_scan_finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub failure_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ScanState {
    Running,
    Completed,
    Failed,
}

/// One background walk-and-ingest run against a single source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanJob {
    pub job_id: Uuid,
    pub source_id: i64,
    pub state: ScanState,
    pub scanned_count: i64,
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum MediaType {
    Image,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ThumbStatus {
    Pending,
    Ready,
    Failed,
}

/// A discovered media file. Identity is `(source_id, dedupe_key)`:
/// the absolute path for local sources, the full `smb://` URL for SMB,
/// both stable across devices and mounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRecord {
    pub id: Uuid,
    pub source_id: i64,
    pub dedupe_key: String,
    pub size: i64,
    /// Unix seconds of the file's last modification.
    pub mtime: i64,
    pub media_type: MediaType,
    pub thumb_status: ThumbStatus,
    pub liked: bool,
    pub favorite: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// User-taggable flags on a media record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaTag {
    Liked,
    Favorite,
}

/// File extensions recognized as album media.
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "bmp", "heic", "heif", "avif", "tiff",
];

pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "avi", "mov", "webm", "m4v", "mpg", "mpeg", "3gp", "ts", "mts", "m2ts",
];

/// Classify a file name against the media allow-list.
pub fn media_type_for(name: &str) -> Option<MediaType> {
    let ext = name.rsplit_once('.')?.1.to_ascii_lowercase();
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaType::Image)
    } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaType::Video)
    } else {
        None
    }
}
