//! Read-only validation of candidate sources.
//!
//! `validate` never mutates anything: no database rows, no stored
//! credentials, no writes under the candidate root. Every failure mode
//! comes back as a structured `ok = false` result with a human note.

use std::collections::VecDeque;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::source::{BackendFactory, LocalBackend, SourceBackend, SourceDescriptor};
use crate::types::media_type_for;

/// Caps keeping the estimate walk cheap on large trees.
const MAX_DIRS: usize = 256;
const MAX_FILES: usize = 2000;
const MAX_DEPTH: usize = 6;
const MAX_SAMPLES: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub ok: bool,
    pub readable: bool,
    #[serde(rename = "absPath")]
    pub canonical_root: String,
    pub estimated_count: u64,
    pub samples: Vec<String>,
    pub note: String,
}

impl ValidationResult {
    fn failure(root: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            ok: false,
            readable: false,
            canonical_root: root.into(),
            estimated_count: 0,
            samples: Vec::new(),
            note: note.into(),
        }
    }
}

/// Check that a candidate source is reachable and enumerable, and
/// estimate how much media it holds.
pub async fn validate(factory: &BackendFactory, descriptor: &SourceDescriptor) -> ValidationResult {
    // Local paths are canonicalized first so the returned root is the
    // one the registry would persist.
    let backend = match descriptor {
        SourceDescriptor::Local { path } => {
            let canonical = match LocalBackend::canonicalize(&PathBuf::from(path)).await {
                Ok(p) => p,
                Err(note) => return ValidationResult::failure(path.clone(), note),
            };
            match factory.for_descriptor(&SourceDescriptor::Local {
                path: canonical.to_string_lossy().into_owned(),
            }) {
                Ok(b) => b,
                Err(e) => return ValidationResult::failure(path.clone(), e.to_string()),
            }
        }
        other => match factory.for_descriptor(other) {
            Ok(b) => b,
            Err(e) => return ValidationResult::failure(String::new(), e.to_string()),
        },
    };

    validate_backend(backend.as_ref()).await
}

/// Backend-agnostic half of validation, shared with tests.
pub async fn validate_backend(backend: &dyn SourceBackend) -> ValidationResult {
    let root = backend.canonical_root().to_string();

    if let Err(note) = backend.probe().await {
        return ValidationResult::failure(root, note);
    }

    let mut estimated = 0u64;
    let mut visited_files = 0usize;
    let mut visited_dirs = 0usize;
    let mut samples = Vec::new();
    let mut truncated = false;

    let mut queue = VecDeque::new();
    queue.push_back((backend.walk_root(), 0usize));

    while let Some((dir, depth)) = queue.pop_front() {
        if visited_dirs >= MAX_DIRS || visited_files >= MAX_FILES {
            truncated = true;
            break;
        }
        visited_dirs += 1;

        let entries = match backend.read_dir(&dir).await {
            Ok(entries) => entries,
            Err(note) => {
                // The root itself being unlistable means the source is
                // not enumerable; deeper failures just trim the sample.
                if dir == backend.walk_root() {
                    return ValidationResult::failure(root, note);
                }
                debug!(dir = %dir.display(), %note, "skipping unreadable subdirectory");
                continue;
            }
        };

        for entry in entries {
            let stat = match backend.stat(&entry).await {
                Ok(stat) => stat,
                Err(_) => continue,
            };
            if stat.is_dir {
                if depth + 1 <= MAX_DEPTH {
                    queue.push_back((entry, depth + 1));
                } else {
                    truncated = true;
                }
            } else if stat.is_file {
                visited_files += 1;
                let name = entry
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if media_type_for(&name).is_some() {
                    estimated += 1;
                    if samples.len() < MAX_SAMPLES {
                        samples.push(backend.dedupe_key(&entry));
                    }
                }
                if visited_files >= MAX_FILES {
                    truncated = true;
                    break;
                }
            }
        }
    }

    let note = if truncated {
        format!("found {estimated}+ media files (estimate capped)")
    } else {
        format!("found {estimated} media files")
    };

    ValidationResult {
        ok: true,
        readable: true,
        canonical_root: root,
        estimated_count: estimated,
        samples,
        note,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryBackend;

    #[tokio::test]
    async fn counts_media_and_collects_samples() {
        let backend = MemoryBackend::new("/m");
        backend.add_file("/m/a.jpg", 10, 1);
        backend.add_file("/m/b.png", 10, 1);
        backend.add_file("/m/notes.txt", 10, 1);
        backend.add_file("/m/sub/c.mp4", 10, 1);

        let result = validate_backend(&backend).await;
        assert!(result.ok);
        assert!(result.readable);
        assert_eq!(result.estimated_count, 3);
        assert_eq!(result.samples.len(), 3);
    }

    #[tokio::test]
    async fn unreachable_backend_is_a_structured_failure() {
        let backend = MemoryBackend::new("/m");
        backend.set_unreachable(true);

        let result = validate_backend(&backend).await;
        assert!(!result.ok);
        assert!(!result.readable);
        assert!(result.note.contains("unreachable"));
        assert_eq!(result.estimated_count, 0);
    }

    #[tokio::test]
    async fn poisoned_subdirectory_trims_but_does_not_fail() {
        let backend = MemoryBackend::new("/m");
        backend.add_file("/m/a.jpg", 10, 1);
        backend.add_dir("/m/private");
        backend.add_file("/m/private/hidden.jpg", 10, 1);
        backend.poison("/m/private");

        let result = validate_backend(&backend).await;
        assert!(result.ok);
        assert_eq!(result.estimated_count, 1);
    }

    #[tokio::test]
    async fn missing_local_path_reports_a_note() {
        let factory = BackendFactory::new(crate::source::BackendSettings {
            smb: crate::source::SmbSettings::default(),
        });
        let result = validate(
            &factory,
            &SourceDescriptor::Local {
                path: "/definitely/not/here".into(),
            },
        )
        .await;
        assert!(!result.ok);
        assert!(result.note.contains("cannot resolve"));
    }
}
