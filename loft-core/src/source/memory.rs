//! In-memory backend for exercising the validator and scan engine
//! without touching a real filesystem. Paths are treated literally;
//! callers should use consistent absolute paths.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{FileStat, SourceBackend};

#[derive(Clone)]
enum Node {
    Dir { children: Vec<PathBuf> },
    File { len: u64, mtime: i64 },
}

#[derive(Default)]
struct Tree {
    nodes: HashMap<PathBuf, Node>,
    poisoned: Vec<PathBuf>,
    unreachable: bool,
}

/// Scriptable backend: files, directories, poisoned subtrees and an
/// unreachable switch.
pub struct MemoryBackend {
    root: PathBuf,
    canonical: String,
    tree: Mutex<Tree>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("root", &self.root)
            .finish()
    }
}

impl MemoryBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let canonical = root.to_string_lossy().into_owned();
        let backend = Self {
            root: root.clone(),
            canonical,
            tree: Mutex::new(Tree::default()),
        };
        backend.add_dir(root);
        backend
    }

    pub fn add_dir(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut tree = self.tree.lock().unwrap();
        if !tree.nodes.contains_key(&path) {
            link_parent(&mut tree.nodes, &path);
            tree.nodes.insert(
                path,
                Node::Dir {
                    children: Vec::new(),
                },
            );
        }
    }

    pub fn add_file(&self, path: impl Into<PathBuf>, len: u64, mtime: i64) {
        let path = path.into();
        let mut tree = self.tree.lock().unwrap();
        link_parent(&mut tree.nodes, &path);
        tree.nodes.insert(path, Node::File { len, mtime });
    }

    pub fn remove(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        let mut tree = self.tree.lock().unwrap();
        tree.nodes.remove(path);
        if let Some(parent) = path.parent() {
            if let Some(Node::Dir { children }) = tree.nodes.get_mut(parent) {
                children.retain(|c| c != path);
            }
        }
    }

    /// Make one subtree fail enumeration, like a permission-denied
    /// directory on disk.
    pub fn poison(&self, path: impl Into<PathBuf>) {
        self.tree.lock().unwrap().poisoned.push(path.into());
    }

    /// Make the whole backend fail probes and directory reads, like a
    /// share that dropped off the network.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.tree.lock().unwrap().unreachable = unreachable;
    }
}

fn link_parent(nodes: &mut HashMap<PathBuf, Node>, path: &Path) {
    if let Some(parent) = path.parent() {
        if !nodes.contains_key(parent) {
            nodes.insert(
                parent.to_path_buf(),
                Node::Dir {
                    children: Vec::new(),
                },
            );
            link_parent(nodes, parent);
        }
        if let Some(Node::Dir { children }) = nodes.get_mut(parent) {
            if !children.iter().any(|c| c == path) {
                children.push(path.to_path_buf());
            }
        }
    }
}

#[async_trait]
impl SourceBackend for MemoryBackend {
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

    async fn probe(&self) -> Result<(), String> {
        if self.tree.lock().unwrap().unreachable {
            return Err(format!("{} is unreachable", self.canonical));
        }
        Ok(())
    }

    async fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>, String> {
        let tree = self.tree.lock().unwrap();
        if tree.unreachable {
            return Err(format!("{} is unreachable", self.canonical));
        }
        if tree.poisoned.iter().any(|p| p == path) {
            return Err(format!("permission denied: {}", path.display()));
        }
        match tree.nodes.get(path) {
            Some(Node::Dir { children }) => Ok(children.clone()),
            Some(Node::File { .. }) => Err(format!("not a directory: {}", path.display())),
            None => Err(format!("no such directory: {}", path.display())),
        }
    }

    async fn stat(&self, path: &Path) -> Result<FileStat, String> {
        let tree = self.tree.lock().unwrap();
        match tree.nodes.get(path) {
            Some(Node::Dir { .. }) => Ok(FileStat {
                is_dir: true,
                is_file: false,
                len: 0,
                mtime: None,
            }),
            Some(Node::File { len, mtime }) => Ok(FileStat {
                is_dir: false,
                is_file: true,
                len: *len,
                mtime: Some(*mtime),
            }),
            None => Err(format!("no such file: {}", path.display())),
        }
    }
}
