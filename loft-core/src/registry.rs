//! The catalog of configured media sources.
//!
//! `create` enforces the path-containment invariant: no two active
//! sources may have roots in an ancestor/descendant relationship.
//! Merging an ancestor over existing children is caller-driven — the
//! conflict response carries the child paths, the caller deletes them
//! and retries.

use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::info;

use crate::credentials::CredentialStore;
use crate::error::Result;
use crate::source::{BackendFactory, SourceDescriptor, is_ancestor_root};
use crate::types::{
    DEFAULT_SCAN_INTERVAL_SECS, MediaSource, ScanStrategy, SourceStatus, SourceType,
};
use crate::validator::{ValidationResult, validate};

/// Creation request: descriptor plus optional presentation/scheduling
/// overrides.
#[derive(Debug, Clone)]
pub struct NewSource {
    pub descriptor: SourceDescriptor,
    pub display_name: Option<String>,
    pub scan_strategy: Option<ScanStrategy>,
    pub scan_interval_seconds: Option<i64>,
}

#[derive(Debug)]
pub enum CreateOutcome {
    Created(MediaSource),
    /// Exact root match against an existing active source; idempotent.
    Existed(MediaSource),
    /// Validation failed; nothing was persisted.
    Invalid(ValidationResult),
    /// Candidate root sits inside an existing active source.
    OverlapParent { parent: String },
    /// Candidate root would swallow existing active sources.
    OverlapChildren { children: Vec<String> },
}

pub struct SourceRegistry {
    pool: SqlitePool,
    factory: BackendFactory,
    credentials: Arc<dyn CredentialStore>,
    /// Serializes the overlap check against the insert; without it two
    /// concurrent creates with nested roots could both pass the check.
    create_lock: Mutex<()>,
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry").finish_non_exhaustive()
    }
}

impl SourceRegistry {
    pub fn new(
        pool: SqlitePool,
        factory: BackendFactory,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            pool,
            factory,
            credentials,
            create_lock: Mutex::new(()),
        }
    }

    /// Dry-run check of a candidate descriptor. Persists nothing.
    pub async fn validate_only(&self, descriptor: &SourceDescriptor) -> ValidationResult {
        validate(&self.factory, descriptor).await
    }

    /// Validate, overlap-check and persist a new source. Stores the
    /// descriptor's credentials on success; writes nothing on any
    /// rejection path.
    pub async fn create(&self, request: NewSource) -> Result<CreateOutcome> {
        let validation = validate(&self.factory, &request.descriptor).await;
        if !validation.ok {
            return Ok(CreateOutcome::Invalid(validation));
        }
        let root = validation.canonical_root.clone();

        let _guard = self.create_lock.lock().await;
        let active = self.active_sources().await?;
        if let Some(existing) = active.iter().find(|s| s.root_path == root) {
            return Ok(CreateOutcome::Existed(existing.clone()));
        }
        if let Some(parent) = active
            .iter()
            .find(|s| is_ancestor_root(&s.root_path, &root))
        {
            return Ok(CreateOutcome::OverlapParent {
                parent: parent.root_path.clone(),
            });
        }
        let children: Vec<String> = active
            .iter()
            .filter(|s| is_ancestor_root(&root, &s.root_path))
            .map(|s| s.root_path.clone())
            .collect();
        if !children.is_empty() {
            return Ok(CreateOutcome::OverlapChildren { children });
        }

        let source_type = request.descriptor.source_type();
        let strategy = request
            .scan_strategy
            .unwrap_or_else(|| ScanStrategy::default_for(source_type));
        let interval = match strategy {
            ScanStrategy::Scheduled => Some(
                request
                    .scan_interval_seconds
                    .unwrap_or(DEFAULT_SCAN_INTERVAL_SECS),
            ),
            _ => request.scan_interval_seconds,
        };

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO media_sources
                (source_type, display_name, root_path, status, scan_strategy,
                 scan_interval_seconds, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(source_type)
        .bind(&request.display_name)
        .bind(&root)
        .bind(SourceStatus::Active)
        .bind(strategy)
        .bind(interval)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        let id = result.last_insert_rowid();

        if let Some(credentials) = request.descriptor.credentials() {
            self.credentials.put(id, credentials).await?;
        }

        info!(source_id = id, root = %root, ?source_type, "registered media source");
        let source = self
            .get(id)
            .await?
            .ok_or_else(|| crate::error::CoreError::Internal("inserted source vanished".into()))?;
        Ok(CreateOutcome::Created(source))
    }

    pub async fn list(&self) -> Result<Vec<MediaSource>> {
        Ok(
            sqlx::query_as::<_, MediaSource>("SELECT * FROM media_sources ORDER BY id")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn get(&self, id: i64) -> Result<Option<MediaSource>> {
        Ok(
            sqlx::query_as::<_, MediaSource>("SELECT * FROM media_sources WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn active_sources(&self) -> Result<Vec<MediaSource>> {
        Ok(sqlx::query_as::<_, MediaSource>(
            "SELECT * FROM media_sources WHERE status = 'active' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    /// Remove a source and its catalog rows. Remote files are never
    /// touched, and the stored credential stays behind for explicit
    /// cleanup (see [`CredentialStore::delete`]). A running scan job
    /// notices the missing source and aborts itself.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        sqlx::query("DELETE FROM media_records WHERE source_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        let result = sqlx::query("DELETE FROM media_sources WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected() > 0;
        if removed {
            info!(source_id = id, "deleted media source");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::MemoryCredentialStore;
    use crate::source::{BackendSettings, SmbSettings};

    async fn registry_with_pool() -> (SourceRegistry, SqlitePool) {
        let pool = crate::test_pool().await;
        let registry = SourceRegistry::new(
            pool.clone(),
            BackendFactory::new(BackendSettings {
                smb: SmbSettings::default(),
            }),
            Arc::new(MemoryCredentialStore::default()),
        );
        (registry, pool)
    }

    fn local(path: &std::path::Path) -> NewSource {
        NewSource {
            descriptor: SourceDescriptor::Local {
                path: path.to_string_lossy().into_owned(),
            },
            display_name: None,
            scan_strategy: Some(ScanStrategy::Manual),
            scan_interval_seconds: None,
        }
    }

    #[tokio::test]
    async fn create_then_recreate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _pool) = registry_with_pool().await;

        let created = match registry.create(local(dir.path())).await.unwrap() {
            CreateOutcome::Created(s) => s,
            other => panic!("expected Created, got {other:?}"),
        };
        match registry.create(local(dir.path())).await.unwrap() {
            CreateOutcome::Existed(s) => assert_eq!(s.id, created.id),
            other => panic!("expected Existed, got {other:?}"),
        }
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn nested_roots_are_rejected_both_ways() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let (registry, _pool) = registry_with_pool().await;

        let parent_root = match registry.create(local(dir.path())).await.unwrap() {
            CreateOutcome::Created(s) => s.root_path,
            other => panic!("expected Created, got {other:?}"),
        };
        match registry.create(local(&sub)).await.unwrap() {
            CreateOutcome::OverlapParent { parent } => assert_eq!(parent, parent_root),
            other => panic!("expected OverlapParent, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ancestor_reports_children_and_merge_succeeds_after_delete() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let (registry, _pool) = registry_with_pool().await;

        let child = match registry.create(local(&sub)).await.unwrap() {
            CreateOutcome::Created(s) => s,
            other => panic!("expected Created, got {other:?}"),
        };
        match registry.create(local(dir.path())).await.unwrap() {
            CreateOutcome::OverlapChildren { children } => {
                assert_eq!(children, vec![child.root_path.clone()]);
            }
            other => panic!("expected OverlapChildren, got {other:?}"),
        }

        // Caller-driven merge: delete the child, retry the parent.
        assert!(registry.delete(child.id).await.unwrap());
        match registry.create(local(dir.path())).await.unwrap() {
            CreateOutcome::Created(_) => {}
            other => panic!("expected Created after merge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_nested_creates_persist_only_one_root() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let (registry, _pool) = registry_with_pool().await;

        let (parent, child) = tokio::join!(
            registry.create(local(dir.path())),
            registry.create(local(&sub)),
        );
        let outcomes = [parent.unwrap(), child.unwrap()];
        let created = outcomes
            .iter()
            .filter(|o| matches!(o, CreateOutcome::Created(_)))
            .count();
        assert_eq!(created, 1);
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_descriptor_persists_nothing() {
        let (registry, _pool) = registry_with_pool().await;
        let outcome = registry
            .create(NewSource {
                descriptor: SourceDescriptor::Local {
                    path: "/no/such/dir/anywhere".into(),
                },
                display_name: None,
                scan_strategy: None,
                scan_interval_seconds: None,
            })
            .await
            .unwrap();
        assert!(matches!(outcome, CreateOutcome::Invalid(_)));
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scheduled_sources_get_a_default_interval() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _pool) = registry_with_pool().await;
        let outcome = registry
            .create(NewSource {
                descriptor: SourceDescriptor::Local {
                    path: dir.path().to_string_lossy().into_owned(),
                },
                display_name: Some("photos".into()),
                scan_strategy: Some(ScanStrategy::Scheduled),
                scan_interval_seconds: None,
            })
            .await
            .unwrap();
        match outcome {
            CreateOutcome::Created(s) => {
                assert_eq!(s.scan_interval_seconds, Some(DEFAULT_SCAN_INTERVAL_SECS));
                assert_eq!(s.display_name.as_deref(), Some("photos"));
            }
            other => panic!("expected Created, got {other:?}"),
        }
    }
}
