//! Source backends: the capability seam between the scan pipeline and
//! heterogeneous storage (local directories, SMB shares).
//!
//! The validator and scan engine only ever talk to [`SourceBackend`];
//! adding a protocol-level SMB client or a WebDAV backend later means
//! implementing this trait, nothing else.

mod local;
mod memory;
mod smb;

pub use local::LocalBackend;
pub use memory::MemoryBackend;
pub use smb::{SmbBackend, SmbSettings, SmbTarget};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::credentials::Credentials;
use crate::error::{CoreError, Result};
use crate::types::{MediaSource, SourceType};

/// Lightweight stat result used by the walker.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub is_dir: bool,
    pub is_file: bool,
    pub len: u64,
    /// Unix seconds of last modification, when the backend knows it.
    pub mtime: Option<i64>,
}

/// Read-only capability set every storage backend provides.
#[async_trait]
pub trait SourceBackend: Send + Sync {
    /// Canonical root identifier for this backend's source.
    fn canonical_root(&self) -> &str;

    /// Local filesystem path where enumeration starts.
    fn walk_root(&self) -> PathBuf;

    /// Stable identity for a file discovered under the walk root.
    fn dedupe_key(&self, path: &Path) -> String;

    /// Resolve a dedupe key back to a locally readable path, if this
    /// backend owns it.
    fn read_path(&self, dedupe_key: &str) -> Option<PathBuf>;

    /// Cheap reachability check. Errors are human-readable notes, not
    /// transport failures.
    async fn probe(&self) -> std::result::Result<(), String>;

    /// List one directory. A failure here poisons only this subtree.
    async fn read_dir(&self, path: &Path) -> std::result::Result<Vec<PathBuf>, String>;

    async fn stat(&self, path: &Path) -> std::result::Result<FileStat, String>;
}

/// Candidate source as submitted for validation or creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceDescriptor {
    Local {
        path: String,
    },
    #[serde(rename_all = "camelCase")]
    Smb {
        host: String,
        share: String,
        #[serde(default)]
        sub_path: Option<String>,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
        #[serde(default)]
        anonymous: bool,
    },
    Webdav {
        url: String,
    },
}

impl SourceDescriptor {
    pub fn source_type(&self) -> SourceType {
        match self {
            SourceDescriptor::Local { .. } => SourceType::Local,
            SourceDescriptor::Smb { .. } => SourceType::Smb,
            SourceDescriptor::Webdav { .. } => SourceType::Webdav,
        }
    }

    /// Extract credentials carried by the descriptor, if any. Anonymous
    /// SMB descriptors have none by definition.
    pub fn credentials(&self) -> Option<Credentials> {
        match self {
            SourceDescriptor::Smb {
                username: Some(user),
                password,
                anonymous: false,
                ..
            } => Some(Credentials::new(
                user.clone(),
                password.clone().unwrap_or_default(),
            )),
            _ => None,
        }
    }
}

/// Settings a [`BackendFactory`] needs beyond the catalog row.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub smb: SmbSettings,
}

/// Maps sources and descriptors to concrete backends. The scan engine
/// depends on this trait so tests can substitute in-memory backends.
pub trait BackendProvider: Send + Sync {
    fn backend_for(&self, source: &MediaSource) -> Result<Arc<dyn SourceBackend>>;
}

#[derive(Debug, Clone)]
pub struct BackendFactory {
    settings: BackendSettings,
}

impl BackendFactory {
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }

    /// Build a backend for a not-yet-persisted candidate. Local paths
    /// are not canonicalized here; the validator does that.
    pub fn for_descriptor(&self, descriptor: &SourceDescriptor) -> Result<Arc<dyn SourceBackend>> {
        match descriptor {
            SourceDescriptor::Local { path } => {
                Ok(Arc::new(LocalBackend::new(PathBuf::from(path))))
            }
            SourceDescriptor::Smb {
                host,
                share,
                sub_path,
                username,
                anonymous,
                ..
            } => {
                let target = SmbTarget::new(
                    host.clone(),
                    share.clone(),
                    sub_path.clone(),
                    if *anonymous { None } else { username.clone() },
                )?;
                Ok(Arc::new(SmbBackend::new(target, self.settings.smb.clone())))
            }
            SourceDescriptor::Webdav { url } => Err(CoreError::InvalidDescriptor(format!(
                "webdav sources are not supported yet: {url}"
            ))),
        }
    }
}

impl BackendProvider for BackendFactory {
    fn backend_for(&self, source: &MediaSource) -> Result<Arc<dyn SourceBackend>> {
        match source.source_type {
            SourceType::Local => {
                Ok(Arc::new(LocalBackend::new(PathBuf::from(&source.root_path))))
            }
            SourceType::Smb => {
                let target = SmbTarget::parse_root(&source.root_path)?;
                Ok(Arc::new(SmbBackend::new(target, self.settings.smb.clone())))
            }
            SourceType::Webdav => Err(CoreError::InvalidDescriptor(
                "webdav sources are not supported yet".into(),
            )),
        }
    }
}

/// Is `ancestor` a strict ancestor of `descendant`? Both are canonical
/// roots ('/'-separated; the scheme prefix of SMB URLs compares like
/// any other segment run).
pub fn is_ancestor_root(ancestor: &str, descendant: &str) -> bool {
    let a = ancestor.trim_end_matches('/');
    let b = descendant.trim_end_matches('/');
    if a == b {
        return false;
    }
    if a.is_empty() {
        // "/" is an ancestor of every absolute path.
        return ancestor.starts_with('/') && b.starts_with('/');
    }
    b.starts_with(a) && b.as_bytes().get(a.len()) == Some(&b'/')
}

/// Do two canonical roots overlap (equal or nested either way)?
pub fn roots_overlap(a: &str, b: &str) -> bool {
    let at = a.trim_end_matches('/');
    let bt = b.trim_end_matches('/');
    at == bt || is_ancestor_root(a, b) || is_ancestor_root(b, a)
}
