//! Local directory backend over tokio::fs.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;

use super::{FileStat, SourceBackend};

#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    canonical: String,
}

impl LocalBackend {
    pub fn new(root: PathBuf) -> Self {
        let canonical = root.to_string_lossy().into_owned();
        Self { root, canonical }
    }

    /// Canonicalize the requested path. Fails with a note (not an
    /// error type) so the validator can surface it verbatim.
    pub async fn canonicalize(path: &Path) -> std::result::Result<PathBuf, String> {
        tokio::fs::canonicalize(path)
            .await
            .map_err(|e| format!("cannot resolve {}: {e}", path.display()))
    }
}

#[async_trait]
impl SourceBackend for LocalBackend {
    fn canonical_root(&self) -> &str {
        &self.canonical
    }

    fn walk_root(&self) -> PathBuf {
        self.root.clone()
    }

    fn dedupe_key(&self, path: &Path) -> String {
        path.to_string_lossy().into_owned()
    }

    fn read_path(&self, dedupe_key: &str) -> Option<PathBuf> {
        let path = PathBuf::from(dedupe_key);
        path.starts_with(&self.root).then_some(path)
    }

    async fn probe(&self) -> std::result::Result<(), String> {
        let md = tokio::fs::metadata(&self.root)
            .await
            .map_err(|e| format!("path {} is not accessible: {e}", self.root.display()))?;
        if !md.is_dir() {
            return Err(format!("path {} is not a directory", self.root.display()));
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
