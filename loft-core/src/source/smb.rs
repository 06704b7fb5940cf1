//! SMB share backend.
//!
//! There is no protocol-level SMB client here: shares are reached
//! through a CIFS mount under a configured mount root, the way network
//! filesystems are normally consumed on a LAN host. The backend still
//! owns the pieces that are SMB-specific: a bounded TCP reachability
//! probe against port 445, credential-free canonical root URLs, and
//! `smb://host/share/...` dedupe keys that stay stable across devices
//! and mount points.

use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::net::TcpStream;
use url::Url;

use super::{FileStat, SourceBackend};
use crate::error::{CoreError, Result};

pub const SMB_PORT: u16 = 445;

#[derive(Debug, Clone)]
pub struct SmbSettings {
    /// Directory under which shares are mounted as
    /// `<mount_root>/<host>/<share>`.
    pub mount_root: PathBuf,
    /// Budget for the TCP reachability probe.
    pub probe_timeout: Duration,
}

impl Default for SmbSettings {
    fn default() -> Self {
        Self {
            mount_root: PathBuf::from("/mnt/smb"),
            probe_timeout: Duration::from_millis(1500),
        }
    }
}

/// Parsed SMB coordinates: host, share, optional subpath, optional
/// username. Passwords never appear here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmbTarget {
    pub host: String,
    pub share: String,
    pub sub_path: Option<String>,
    pub username: Option<String>,
}

impl SmbTarget {
    pub fn new(
        host: String,
        share: String,
        sub_path: Option<String>,
        username: Option<String>,
    ) -> Result<Self> {
        if host.trim().is_empty() {
            return Err(CoreError::InvalidDescriptor("smb host is empty".into()));
        }
        if share.trim().is_empty() || share.contains('/') {
            return Err(CoreError::InvalidDescriptor(format!(
                "invalid smb share name: {share:?}"
            )));
        }
        let sub_path = sub_path
            .map(|s| s.trim_matches('/').to_string())
            .filter(|s| !s.is_empty());
        Ok(Self {
            host,
            share,
            sub_path,
            username,
        })
    }

    /// Parse a persisted canonical root of the form
    /// `smb://[user@]host/share[/subpath]`.
    pub fn parse_root(root: &str) -> Result<Self> {
        let url = Url::parse(root)
            .map_err(|e| CoreError::InvalidDescriptor(format!("invalid smb root {root:?}: {e}")))?;
        if url.scheme() != "smb" {
            return Err(CoreError::InvalidDescriptor(format!(
                "expected smb:// root, got {root:?}"
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| CoreError::InvalidDescriptor(format!("smb root {root:?} has no host")))?
            .to_string();
        let mut segments: Vec<String> = url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).map(str::to_string).collect())
            .unwrap_or_default();
        if segments.is_empty() {
            return Err(CoreError::InvalidDescriptor(format!(
                "smb root {root:?} has no share"
            )));
        }
        let share = segments.remove(0);
        let sub_path = (!segments.is_empty()).then(|| segments.join("/"));
        let username = (!url.username().is_empty()).then(|| url.username().to_string());
        Self::new(host, share, sub_path, username)
    }

    /// Canonical root identifier, optionally carrying the username but
    /// never the password.
    pub fn canonical_root(&self) -> String {
        let user = self
            .username
            .as_deref()
            .map(|u| format!("{u}@"))
            .unwrap_or_default();
        let sub = self
            .sub_path
            .as_deref()
            .map(|s| format!("/{s}"))
            .unwrap_or_default();
        format!("smb://{user}{}/{}{sub}", self.host, self.share)
    }

    /// Root used in dedupe keys: like the canonical root but always
    /// credential-free, so identity survives a username change.
    fn key_root(&self) -> String {
        let sub = self
            .sub_path
            .as_deref()
            .map(|s| format!("/{s}"))
            .unwrap_or_default();
        format!("smb://{}/{}{sub}", self.host, self.share)
    }
}

pub struct SmbBackend {
    target: SmbTarget,
    settings: SmbSettings,
    canonical: String,
    key_root: String,
    walk_root: PathBuf,
}

impl SmbBackend {
    pub fn new(target: SmbTarget, settings: SmbSettings) -> Self {
        let canonical = target.canonical_root();
        let key_root = target.key_root();
        let mut walk_root = settings.mount_root.join(&target.host).join(&target.share);
        if let Some(sub) = &target.sub_path {
            walk_root = walk_root.join(sub);
        }
        Self {
            target,
            settings,
            canonical,
            key_root,
            walk_root,
        }
    }

    pub fn target(&self) -> &SmbTarget {
        &self.target
    }
}

impl std::fmt::Debug for SmbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmbBackend")
            .field("root", &self.canonical)
            .field("walk_root", &self.walk_root)
            .finish()
    }
}

#[async_trait]
impl SourceBackend for SmbBackend {
    fn canonical_root(&self) -> &str {
        &self.canonical
    }

    fn walk_root(&self) -> PathBuf {
        self.walk_root.clone()
    }

    fn dedupe_key(&self, path: &Path) -> String {
        match path.strip_prefix(&self.walk_root) {
            Ok(rel) => {
                let rel: Vec<String> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                if rel.is_empty() {
                    self.key_root.clone()
                } else {
                    format!("{}/{}", self.key_root, rel.join("/"))
                }
            }
            Err(_) => path.to_string_lossy().into_owned(),
        }
    }

    fn read_path(&self, dedupe_key: &str) -> Option<PathBuf> {
        let rest = dedupe_key.strip_prefix(&self.key_root)?;
        let rest = rest.strip_prefix('/')?;
        if rest.is_empty() || rest.contains("..") {
            return None;
        }
        Some(self.walk_root.join(rest))
    }

    async fn probe(&self) -> std::result::Result<(), String> {
        let addr = (self.target.host.clone(), SMB_PORT);
        match tokio::time::timeout(self.settings.probe_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                return Err(format!("host {} is unreachable: {e}", self.target.host));
            }
            Err(_) => {
                return Err(format!(
                    "host {} did not answer within {:?}",
                    self.target.host, self.settings.probe_timeout
                ));
            }
        }
        let md = tokio::fs::metadata(&self.walk_root).await.map_err(|e| {
            format!(
                "share {} is not mounted at {} ({e}); check mount and credentials",
                self.canonical,
                self.walk_root.display()
            )
        })?;
        if !md.is_dir() {
            return Err(format!(
                "mount point {} is not a directory",
                self.walk_root.display()
            ));
        }
        Ok(())
    }

    async fn read_dir(&self, path: &Path) -> std::result::Result<Vec<PathBuf>, String> {
        let mut rd = tokio::fs::read_dir(path)
            .await
            .map_err(|e| format!("read_dir failed for {}: {e}", path.display()))?;
        let mut entries = Vec::new();
        loop {
            match rd.next_entry().await {
                Ok(Some(entry)) => entries.push(entry.path()),
                Ok(None) => break,
                Err(e) => return Err(format!("read_dir entry failed in {}: {e}", path.display())),
            }
        }
        Ok(entries)
    }

    async fn stat(&self, path: &Path) -> std::result::Result<FileStat, String> {
        let md = tokio::fs::metadata(path)
            .await
            .map_err(|e| format!("stat failed for {}: {e}", path.display()))?;
        let mtime = md
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64);
        Ok(FileStat {
            is_dir: md.is_dir(),
            is_file: md.is_file(),
            len: md.len(),
            mtime,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SmbTarget {
        SmbTarget::new(
            "nas.local".into(),
            "photos".into(),
            Some("2024".into()),
            Some("alice".into()),
        )
        .unwrap()
    }

    #[test]
    fn canonical_root_carries_user_but_key_root_does_not() {
        let t = target();
        assert_eq!(t.canonical_root(), "smb://alice@nas.local/photos/2024");
        assert_eq!(t.key_root(), "smb://nas.local/photos/2024");
    }

    #[test]
    fn parse_root_round_trips() {
        let t = target();
        let parsed = SmbTarget::parse_root(&t.canonical_root()).unwrap();
        assert_eq!(parsed, t);

        let anon = SmbTarget::parse_root("smb://nas/media").unwrap();
        assert_eq!(anon.username, None);
        assert_eq!(anon.sub_path, None);
    }

    #[test]
    fn parse_root_rejects_garbage() {
        assert!(SmbTarget::parse_root("http://nas/share").is_err());
        assert!(SmbTarget::parse_root("smb://nas").is_err());
        assert!(SmbTarget::parse_root("not a url").is_err());
    }

    #[test]
    fn dedupe_keys_map_mount_paths_to_urls_and_back() {
        let backend = SmbBackend::new(
            target(),
            SmbSettings {
                mount_root: PathBuf::from("/mnt/smb"),
                ..SmbSettings::default()
            },
        );
        let file = PathBuf::from("/mnt/smb/nas.local/photos/2024/trip/a.jpg");
        let key = backend.dedupe_key(&file);
        assert_eq!(key, "smb://nas.local/photos/2024/trip/a.jpg");
        assert_eq!(backend.read_path(&key), Some(file));
        assert!(backend.read_path("smb://other/photos/a.jpg").is_none());
        assert!(
            backend
                .read_path("smb://nas.local/photos/2024/../escape.jpg")
                .is_none()
        );
    }
}
