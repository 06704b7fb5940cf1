//! Realtime ingestion for local sources: one `notify` watcher per
//! active `realtime` source, with changes debounced into full source
//! scans rather than applied file-by-file. The scan engine's upserts
//! are idempotent, so a burst of events costs one walk.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use sqlx::SqlitePool;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::source::BackendProvider;
use crate::types::{MediaSource, media_type_for};

use super::ScanEngine;

/// Quiet period after the last event before a source is rescanned.
const DEBOUNCE: Duration = Duration::from_secs(2);
/// How often the watcher set is reconciled against the registry.
const RECONCILE_EVERY: Duration = Duration::from_secs(30);

pub struct WatchService {
    pool: SqlitePool,
    engine: Arc<ScanEngine>,
    provider: Arc<dyn BackendProvider>,
    watchers: Mutex<HashMap<i64, RecommendedWatcher>>,
    dirty_tx: mpsc::UnboundedSender<i64>,
    dirty_rx: Mutex<mpsc::UnboundedReceiver<i64>>,
}

impl WatchService {
    pub fn new(
        pool: SqlitePool,
        engine: Arc<ScanEngine>,
        provider: Arc<dyn BackendProvider>,
    ) -> Arc<Self> {
        let (dirty_tx, dirty_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            pool,
            engine,
            provider,
            watchers: Mutex::new(HashMap::new()),
            dirty_tx,
            dirty_rx: Mutex::new(dirty_rx),
        })
    }

    /// Run forever; spawn this on the runtime. Keeps the watcher set in
    /// sync with the registry and flushes debounced changes into scans.
    pub async fn run(self: Arc<Self>) {
        let mut reconcile = tokio::time::interval(RECONCILE_EVERY);
        reconcile.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut pending: HashSet<i64> = HashSet::new();
        let mut flush = tokio::time::interval(DEBOUNCE);
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut rx = self.dirty_rx.lock().await;
        loop {
            tokio::select! {
                _ = reconcile.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!(error = %e, "watcher reconcile failed");
                    }
                }
                _ = flush.tick() => {
                    for source_id in pending.drain() {
                        debug!(source_id, "flushing debounced filesystem changes");
                        if let Err(e) = self.engine.trigger(source_id, false).await {
                            warn!(source_id, error = %e, "watch-triggered scan failed");
                        }
                    }
                }
                changed = rx.recv() => {
                    match changed {
                        Some(source_id) => {
                            pending.insert(source_id);
                            flush.reset();
                        }
                        None => return,
                    }
                }
            }
        }
    }

    /// Align the watcher set with the active `realtime` local sources.
    async fn reconcile(&self) -> Result<()> {
        let sources = sqlx::query_as::<_, MediaSource>(
            r#"
            SELECT * FROM media_sources
            WHERE status = 'active' AND scan_strategy = 'realtime' AND source_type = 'local'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let wanted: HashMap<i64, PathBuf> = sources
            .iter()
            .filter_map(|s| {
                self.provider
                    .backend_for(s)
                    .ok()
                    .map(|backend| (s.id, backend.walk_root()))
            })
            .collect();

        let mut watchers = self.watchers.lock().await;

        let stale: Vec<i64> = watchers
            .keys()
            .filter(|id| !wanted.contains_key(id))
            .copied()
            .collect();
        for id in stale {
            watchers.remove(&id);
            info!(source_id = id, "stopped watching source");
        }

        for (source_id, root) in wanted {
            if watchers.contains_key(&source_id) {
                continue;
            }
            match self.spawn_watcher(source_id, &root) {
                Ok(watcher) => {
                    info!(source_id, root = %root.display(), "watching source");
                    watchers.insert(source_id, watcher);
                }
                Err(e) => {
                    warn!(source_id, root = %root.display(), error = %e, "failed to watch source")
                }
            }
        }
        Ok(())
    }

    fn spawn_watcher(
        &self,
        source_id: i64,
        root: &PathBuf,
    ) -> std::result::Result<RecommendedWatcher, notify::Error> {
        let dirty_tx = self.dirty_tx.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if event_is_relevant(&event) {
                        let _ = dirty_tx.send(source_id);
                    }
                }
                Err(e) => warn!(source_id, error = %e, "watch error"),
            },
            NotifyConfig::default(),
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        Ok(watcher)
    }
}

/// Only create/modify/remove events for media files (or whole
/// directories) warrant a rescan.
fn event_is_relevant(event: &Event) -> bool {
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {}
        EventKind::Any | EventKind::Access(_) | EventKind::Other => return false,
    }
    event.paths.iter().any(|path| {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy()) else {
            return false;
        };
        // Removed paths and directories carry no readable metadata, so
        // lean on the name alone and let the scan sort it out.
        media_type_for(&name).is_some() || path.extension().is_none()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind};

    fn event(kind: EventKind, path: &str) -> Event {
        let mut e = Event::new(kind);
        e.paths.push(PathBuf::from(path));
        e
    }

    #[test]
    fn media_changes_are_relevant() {
        assert!(event_is_relevant(&event(
            EventKind::Create(CreateKind::File),
            "/m/new.jpg"
        )));
        assert!(event_is_relevant(&event(
            EventKind::Modify(ModifyKind::Any),
            "/m/clip.mp4"
        )));
        // Directory events have no extension; a rescan decides.
        assert!(event_is_relevant(&event(
            EventKind::Create(CreateKind::Folder),
            "/m/newdir"
        )));
    }

    #[test]
    fn noise_is_ignored() {
        assert!(!event_is_relevant(&event(
            EventKind::Create(CreateKind::File),
            "/m/notes.txt"
        )));
        assert!(!event_is_relevant(&event(EventKind::Any, "/m/new.jpg")));
    }
}
