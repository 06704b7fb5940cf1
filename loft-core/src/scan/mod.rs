//! Background scan jobs: walk a source, diff against known identities,
//! upsert the catalog, track progress in a persisted job row.
//!
//! The one-running-job-per-source rule lives in the database (partial
//! unique index on `scan_jobs(source_id) WHERE state = 'running'`), so
//! it holds across process restarts; a second trigger while a job runs
//! coalesces onto the running job instead of racing its upserts.

mod scheduler;
mod watcher;

pub use scheduler::{Scheduler, effective_interval};
pub use watcher::WatchService;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::MediaCatalog;
use crate::error::{CoreError, Result};
use crate::source::{BackendProvider, SourceBackend};
use crate::types::{MediaSource, ScanJob, ScanState, media_type_for};

/// How many files a job walks between liveness checks of its source.
const LIVENESS_CHECK_EVERY: u64 = 64;

#[derive(Debug, Clone)]
pub struct TriggerOutcome {
    pub job: ScanJob,
    /// True when this trigger attached to an already-running job
    /// instead of starting a walk.
    pub coalesced: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    job_id: String,
    source_id: i64,
    state: ScanState,
    scanned_count: i64,
    message: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for ScanJob {
    type Error = CoreError;

    fn try_from(row: JobRow) -> Result<Self> {
        let job_id = Uuid::parse_str(&row.job_id)
            .map_err(|e| CoreError::Internal(format!("corrupt job id {:?}: {e}", row.job_id)))?;
        Ok(ScanJob {
            job_id,
            source_id: row.source_id,
            state: row.state,
            scanned_count: row.scanned_count,
            message: row.message,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

pub struct ScanEngine {
    pool: SqlitePool,
    catalog: MediaCatalog,
    provider: Arc<dyn BackendProvider>,
}

impl std::fmt::Debug for ScanEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanEngine").finish_non_exhaustive()
    }
}

impl ScanEngine {
    pub fn new(pool: SqlitePool, provider: Arc<dyn BackendProvider>) -> Arc<Self> {
        let catalog = MediaCatalog::new(pool.clone());
        Arc::new(Self {
            pool,
            catalog,
            provider,
        })
    }

    /// Mark jobs left `running` by a crashed process as failed. Called
    /// once at startup, before any new trigger is accepted.
    pub async fn reconcile_interrupted(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET state = 'failed', message = 'interrupted by server restart', finished_at = ?
            WHERE state = 'running'
            "#,
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        let reconciled = result.rows_affected();
        if reconciled > 0 {
            warn!(jobs = reconciled, "reconciled interrupted scan jobs");
        }
        Ok(reconciled)
    }

    /// Start a scan for a source, or attach to the one already running.
    pub async fn trigger(
        self: &Arc<Self>,
        source_id: i64,
        purge_missing: bool,
    ) -> Result<TriggerOutcome> {
        let source = self.active_source(source_id).await?;

        // Insert-or-coalesce can race a job finishing right between the
        // two statements; one retry covers that window.
        for _ in 0..2 {
            let job_id = Uuid::new_v4();
            let started = Utc::now();
            let inserted = sqlx::query(
                "INSERT INTO scan_jobs (job_id, source_id, started_at) VALUES (?, ?, ?)",
            )
            .bind(job_id.to_string())
            .bind(source_id)
            .bind(started)
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => {
                    sqlx::query(
                        "UPDATE media_sources SET last_scan_started_at = ?, updated_at = ? WHERE id = ?",
                    )
                    .bind(started)
                    .bind(started)
                    .bind(source_id)
                    .execute(&self.pool)
                    .await?;

                    let job = ScanJob {
                        job_id,
                        source_id,
                        state: ScanState::Running,
                        scanned_count: 0,
                        message: None,
                        started_at: started,
                        finished_at: None,
                    };
                    info!(source_id, %job_id, purge_missing, "scan job started");

                    let engine = Arc::clone(self);
                    tokio::spawn(async move {
                        engine.run_job(job_id, source, purge_missing).await;
                    });
                    return Ok(TriggerOutcome {
                        job,
                        coalesced: false,
                    });
                }
                Err(e) if is_unique_violation(&e) => {
                    if let Some(job) = self.running_job_for(source_id).await? {
                        return Ok(TriggerOutcome {
                            job,
                            coalesced: true,
                        });
                    }
                    // The running job just finished; try inserting again.
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(CoreError::Internal(format!(
            "could not start or coalesce a scan for source {source_id}"
        )))
    }

    pub async fn status(&self, job_id: Uuid) -> Result<Option<ScanJob>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM scan_jobs WHERE job_id = ?")
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(ScanJob::try_from).transpose()
    }

    pub async fn running_job_for(&self, source_id: i64) -> Result<Option<ScanJob>> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM scan_jobs WHERE source_id = ? AND state = 'running'",
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ScanJob::try_from).transpose()
    }

    async fn active_source(&self, source_id: i64) -> Result<MediaSource> {
        let source = sqlx::query_as::<_, MediaSource>(
            "SELECT * FROM media_sources WHERE id = ? AND status = 'active'",
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        source.ok_or_else(|| CoreError::NotFound(format!("no active source with id {source_id}")))
    }

    async fn run_job(self: Arc<Self>, job_id: Uuid, source: MediaSource, purge_missing: bool) {
        let backend = match self.provider.backend_for(&source) {
            Ok(backend) => backend,
            Err(e) => {
                self.finish_failed(job_id, source.id, &e.to_string()).await;
                return;
            }
        };

        match self.walk(job_id, &source, backend.as_ref(), purge_missing).await {
            Ok(summary) => self.finish_completed(job_id, source.id, summary).await,
            Err(reason) => self.finish_failed(job_id, source.id, &reason).await,
        }
    }

    /// Walk the source tree. Per-entry failures are logged and skipped;
    /// only root-level failures (or the source disappearing) abort with
    /// an `Err` carrying the failure message.
    async fn walk(
        &self,
        job_id: Uuid,
        source: &MediaSource,
        backend: &dyn SourceBackend,
        purge_missing: bool,
    ) -> std::result::Result<WalkSummary, String> {
        backend.probe().await?;

        let root = backend.walk_root();
        let mut queue = VecDeque::new();
        queue.push_back(root.clone());

        let mut summary = WalkSummary::default();
        let mut seen: HashSet<String> = HashSet::new();

        while let Some(dir) = queue.pop_front() {
            let entries = match backend.read_dir(&dir).await {
                Ok(entries) => entries,
                Err(note) if dir == root => return Err(note),
                Err(note) => {
                    warn!(job = %job_id, dir = %dir.display(), %note, "skipping unreadable directory");
                    summary.skipped += 1;
                    continue;
                }
            };

            for entry in entries {
                let stat = match backend.stat(&entry).await {
                    Ok(stat) => stat,
                    Err(note) => {
                        warn!(job = %job_id, path = %entry.display(), %note, "skipping unreadable entry");
                        summary.skipped += 1;
                        continue;
                    }
                };
                if stat.is_dir {
                    queue.push_back(entry);
                    continue;
                }
                if !stat.is_file {
                    continue;
                }
                let name = entry
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let Some(media_type) = media_type_for(&name) else {
                    continue;
                };

                let key = backend.dedupe_key(&entry);
                match self
                    .catalog
                    .upsert(
                        source.id,
                        &key,
                        stat.len as i64,
                        stat.mtime.unwrap_or(0),
                        media_type,
                    )
                    .await
                {
                    Ok(outcome) => summary.record(outcome),
                    Err(e) => {
                        warn!(job = %job_id, %key, error = %e, "catalog upsert failed");
                        summary.skipped += 1;
                        continue;
                    }
                }
                if purge_missing {
                    seen.insert(key);
                }

                summary.scanned += 1;
                // Write-through so pollers see live progress.
                if let Err(e) = self.bump_progress(job_id, summary.scanned).await {
                    warn!(job = %job_id, error = %e, "progress update failed");
                }
                if summary.scanned % LIVENESS_CHECK_EVERY == 0
                    && !self.source_still_active(source.id).await
                {
                    return Err("source deleted during scan".into());
                }
            }
        }

        if !self.source_still_active(source.id).await {
            return Err("source deleted during scan".into());
        }

        if purge_missing {
            match self.catalog.purge_missing(source.id, &seen).await {
                Ok(purged) => summary.purged = purged,
                Err(e) => warn!(job = %job_id, error = %e, "purge of missing records failed"),
            }
        }

        Ok(summary)
    }

    async fn bump_progress(&self, job_id: Uuid, scanned: u64) -> Result<()> {
        sqlx::query("UPDATE scan_jobs SET scanned_count = ? WHERE job_id = ?")
            .bind(scanned as i64)
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn source_still_active(&self, source_id: i64) -> bool {
        sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM media_sources WHERE id = ? AND status = 'active'",
        )
        .bind(source_id)
        .fetch_one(&self.pool)
        .await
        .map(|n| n > 0)
        .unwrap_or(false)
    }

    async fn finish_completed(&self, job_id: Uuid, source_id: i64, summary: WalkSummary) {
        let now = Utc::now();
        let message = summary.describe();
        info!(%job_id, source_id, %message, "scan job completed");
        if let Err(e) = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET state = 'completed', message = ?, finished_at = ?
            WHERE job_id = ? AND state = 'running'
            "#,
        )
        .bind(&message)
        .bind(now)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        {
            warn!(%job_id, error = %e, "failed to record job completion");
        }
        if let Err(e) = sqlx::query(
            r#"
            UPDATE media_sources
            SET last_scan_finished_at = ?, failure_count = 0, last_error = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(source_id)
        .execute(&self.pool)
        .await
        {
            warn!(source_id, error = %e, "failed to record source scan success");
        }
    }

    async fn finish_failed(&self, job_id: Uuid, source_id: i64, reason: &str) {
        let now = Utc::now();
        warn!(%job_id, source_id, %reason, "scan job failed");
        if let Err(e) = sqlx::query(
            r#"
            UPDATE scan_jobs
            SET state = 'failed', message = ?, finished_at = ?
            WHERE job_id = ? AND state = 'running'
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await
        {
            warn!(%job_id, error = %e, "failed to record job failure");
        }
        // The source may be gone (delete-during-scan); a zero-row
        // update is fine.
        if let Err(e) = sqlx::query(
            r#"
            UPDATE media_sources
            SET failure_count = failure_count + 1, last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(source_id)
        .execute(&self.pool)
        .await
        {
            warn!(source_id, error = %e, "failed to record source scan failure");
        }
    }
}

#[derive(Debug, Default)]
struct WalkSummary {
    scanned: u64,
    inserted: u64,
    updated: u64,
    skipped: u64,
    purged: u64,
}

impl WalkSummary {
    fn record(&mut self, outcome: crate::catalog::UpsertOutcome) {
        use crate::catalog::UpsertOutcome::*;
        match outcome {
            Inserted => self.inserted += 1,
            Updated => self.updated += 1,
            Unchanged => {}
        }
    }

    fn describe(&self) -> String {
        let mut parts = vec![format!(
            "scanned {}, {} new, {} updated",
            self.scanned, self.inserted, self.updated
        )];
        if self.skipped > 0 {
            parts.push(format!("{} skipped", self.skipped));
        }
        if self.purged > 0 {
            parts.push(format!("{} purged", self.purged));
        }
        parts.join(", ")
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemoryBackend;
    use std::time::Duration;

    struct FixedProvider(Arc<MemoryBackend>);

    impl BackendProvider for FixedProvider {
        fn backend_for(&self, _source: &MediaSource) -> Result<Arc<dyn SourceBackend>> {
            let backend: Arc<dyn SourceBackend> = self.0.clone();
            Ok(backend)
        }
    }

    async fn setup(backend: Arc<MemoryBackend>) -> (Arc<ScanEngine>, SqlitePool, i64) {
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
        let engine = ScanEngine::new(pool.clone(), Arc::new(FixedProvider(backend)));
        (engine, pool, 1)
    }

    async fn wait_terminal(engine: &ScanEngine, job_id: Uuid) -> ScanJob {
        for _ in 0..200 {
            let job = engine.status(job_id).await.unwrap().unwrap();
            if job.state != ScanState::Running {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn scan_ingests_media_and_reports_progress() {
        let backend = Arc::new(MemoryBackend::new("/m"));
        backend.add_file("/m/a.jpg", 10, 1);
        backend.add_file("/m/b.png", 20, 2);
        backend.add_file("/m/sub/c.mp4", 30, 3);
        backend.add_file("/m/readme.txt", 5, 4);
        let (engine, _pool, src) = setup(backend).await;

        let outcome = engine.trigger(src, false).await.unwrap();
        assert!(!outcome.coalesced);
        let job = wait_terminal(&engine, outcome.job.job_id).await;
        assert_eq!(job.state, ScanState::Completed);
        assert_eq!(job.scanned_count, 3);
        assert!(job.finished_at.is_some());

        assert_eq!(engine.catalog.count_for_source(src).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn rescanning_an_unchanged_tree_inserts_nothing() {
        let backend = Arc::new(MemoryBackend::new("/m"));
        backend.add_file("/m/a.jpg", 10, 1);
        backend.add_file("/m/b.jpg", 20, 2);
        let (engine, _pool, src) = setup(backend).await;

        let first = engine.trigger(src, false).await.unwrap();
        wait_terminal(&engine, first.job.job_id).await;
        assert_eq!(engine.catalog.count_for_source(src).await.unwrap(), 2);

        let second = engine.trigger(src, false).await.unwrap();
        assert_ne!(second.job.job_id, first.job.job_id);
        let job = wait_terminal(&engine, second.job.job_id).await;
        assert_eq!(job.state, ScanState::Completed);
        assert_eq!(engine.catalog.count_for_source(src).await.unwrap(), 2);
        assert!(job.message.unwrap().contains("0 new"));
    }

    #[tokio::test]
    async fn poisoned_subtree_is_skipped_not_fatal() {
        let backend = Arc::new(MemoryBackend::new("/m"));
        backend.add_file("/m/a.jpg", 10, 1);
        backend.add_dir("/m/broken");
        backend.add_file("/m/broken/b.jpg", 10, 1);
        backend.poison("/m/broken");
        let (engine, _pool, src) = setup(backend).await;

        let outcome = engine.trigger(src, false).await.unwrap();
        let job = wait_terminal(&engine, outcome.job.job_id).await;
        assert_eq!(job.state, ScanState::Completed);
        assert_eq!(engine.catalog.count_for_source(src).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unreachable_root_fails_the_job_and_counts_against_the_source() {
        let backend = Arc::new(MemoryBackend::new("/m"));
        backend.set_unreachable(true);
        let (engine, pool, src) = setup(backend).await;

        let outcome = engine.trigger(src, false).await.unwrap();
        let job = wait_terminal(&engine, outcome.job.job_id).await;
        assert_eq!(job.state, ScanState::Failed);
        assert!(job.message.unwrap().contains("unreachable"));

        let (failures, last_error): (i64, Option<String>) = sqlx::query_as(
            "SELECT failure_count, last_error FROM media_sources WHERE id = ?",
        )
        .bind(src)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(failures, 1);
        assert!(last_error.unwrap().contains("unreachable"));
    }

    #[tokio::test]
    async fn concurrent_trigger_coalesces_onto_the_running_job() {
        let backend = Arc::new(MemoryBackend::new("/m"));
        let (engine, pool, src) = setup(backend).await;

        // Pin a running job row so the second trigger must coalesce.
        let held = Uuid::new_v4();
        sqlx::query("INSERT INTO scan_jobs (job_id, source_id, started_at) VALUES (?, ?, ?)")
            .bind(held.to_string())
            .bind(src)
            .bind(Utc::now())
            .execute(&pool)
            .await
            .unwrap();

        let outcome = engine.trigger(src, false).await.unwrap();
        assert!(outcome.coalesced);
        assert_eq!(outcome.job.job_id, held);
        assert_eq!(outcome.job.state, ScanState::Running);
    }

    #[tokio::test]
    async fn purge_missing_removes_only_vanished_records() {
        let backend = Arc::new(MemoryBackend::new("/m"));
        backend.add_file("/m/keep.jpg", 10, 1);
        backend.add_file("/m/gone.jpg", 10, 2);
        let (engine, _pool, src) = setup(backend.clone()).await;

        let first = engine.trigger(src, false).await.unwrap();
        wait_terminal(&engine, first.job.job_id).await;
        assert_eq!(engine.catalog.count_for_source(src).await.unwrap(), 2);

        backend.remove("/m/gone.jpg");

        // Default scans leave absent files alone.
        let second = engine.trigger(src, false).await.unwrap();
        wait_terminal(&engine, second.job.job_id).await;
        assert_eq!(engine.catalog.count_for_source(src).await.unwrap(), 2);

        // The explicit purge mode drops them.
        let third = engine.trigger(src, true).await.unwrap();
        let job = wait_terminal(&engine, third.job.job_id).await;
        assert_eq!(job.state, ScanState::Completed);
        assert!(job.message.unwrap().contains("1 purged"));
        assert_eq!(engine.catalog.count_for_source(src).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reconcile_marks_stale_running_jobs_failed() {
        let backend = Arc::new(MemoryBackend::new("/m"));
        let (engine, pool, src) = setup(backend).await;

        let stale = Uuid::new_v4();
        sqlx::query("INSERT INTO scan_jobs (job_id, source_id, started_at) VALUES (?, ?, ?)")
            .bind(stale.to_string())
            .bind(src)
            .bind(Utc::now())
            .execute(&pool)
            .await
            .unwrap();

        assert_eq!(engine.reconcile_interrupted().await.unwrap(), 1);
        let job = engine.status(stale).await.unwrap().unwrap();
        assert_eq!(job.state, ScanState::Failed);
        assert!(job.message.unwrap().contains("restart"));
    }
}
