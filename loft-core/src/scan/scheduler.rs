//! Periodic scan scheduling for sources that cannot be watched in
//! realtime (network shares, mostly). Failing sources back off
//! exponentially so an offline NAS does not get hammered every tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{DEFAULT_SCAN_INTERVAL_SECS, MediaSource};

use super::ScanEngine;

const MAX_BACKOFF_DOUBLINGS: u32 = 5;

/// Interval between scans after `failure_count` consecutive failures.
/// Doubles per failure, capped at 32x the configured interval.
pub fn effective_interval(interval_seconds: i64, failure_count: i64) -> Duration {
    let base = if interval_seconds > 0 {
        interval_seconds as u64
    } else {
        DEFAULT_SCAN_INTERVAL_SECS as u64
    };
    let doublings = (failure_count.max(0) as u32).min(MAX_BACKOFF_DOUBLINGS);
    Duration::from_secs(base << doublings)
}

pub struct Scheduler {
    pool: SqlitePool,
    engine: Arc<ScanEngine>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(pool: SqlitePool, engine: Arc<ScanEngine>, tick: Duration) -> Self {
        Self { pool, engine, tick }
    }

    /// Run forever; spawn this on the runtime.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick_once().await {
                warn!(error = %e, "scheduler tick failed");
            }
        }
    }

    async fn tick_once(&self) -> Result<()> {
        for source in self.due_sources().await? {
            debug!(source_id = source.id, root = %source.root_path, "scheduled scan due");
            // Coalescing in the engine makes a still-running previous
            // job harmless here.
            if let Err(e) = self.engine.trigger(source.id, false).await {
                warn!(source_id = source.id, error = %e, "scheduled trigger failed");
            }
        }
        Ok(())
    }

    async fn due_sources(&self) -> Result<Vec<MediaSource>> {
        let sources = sqlx::query_as::<_, MediaSource>(
            "SELECT * FROM media_sources WHERE status = 'active' AND scan_strategy = 'scheduled'",
        )
        .fetch_all(&self.pool)
        .await?;

        let now = Utc::now();
        Ok(sources
            .into_iter()
            .filter(|s| {
                let Some(last) = s.last_scan_started_at else {
                    return true;
                };
                let wait =
                    effective_interval(s.scan_interval_seconds.unwrap_or(0), s.failure_count);
                now.signed_duration_since(last).num_seconds() >= wait.as_secs() as i64
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_failure_and_caps() {
        assert_eq!(effective_interval(3600, 0), Duration::from_secs(3600));
        assert_eq!(effective_interval(3600, 1), Duration::from_secs(7200));
        assert_eq!(effective_interval(3600, 3), Duration::from_secs(28_800));
        assert_eq!(effective_interval(3600, 5), Duration::from_secs(115_200));
        // Caps at 32x, even for absurd failure counts.
        assert_eq!(effective_interval(3600, 50), Duration::from_secs(115_200));
        assert_eq!(effective_interval(3600, i64::MAX), effective_interval(3600, 5));
    }

    #[test]
    fn nonsense_intervals_fall_back_to_the_default() {
        assert_eq!(
            effective_interval(0, 0),
            Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS as u64)
        );
        assert_eq!(
            effective_interval(-1, 0),
            Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS as u64)
        );
    }
}
