//! The persisted table of discovered media items.
//!
//! Identity is `(source_id, dedupe_key)`; re-scanning an unchanged
//! file is a no-op, a changed file updates its row in place, and rows
//! are only ever deleted through an explicit purge or source removal.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::types::{MediaRecord, MediaTag, MediaType, ThumbStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListOrder {
    #[default]
    Newest,
    Oldest,
    /// Deterministic shuffle driven by a session seed.
    Shuffle,
}

#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub offset: i64,
    pub limit: i64,
    pub tag: Option<MediaTag>,
    pub order: ListOrder,
    pub seed: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPage {
    pub items: Vec<MediaRecord>,
    pub offset: i64,
    pub has_more: bool,
}

/// Database row; ids are stored as hyphenated UUID text.
#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    id: String,
    source_id: i64,
    dedupe_key: String,
    size: i64,
    mtime: i64,
    media_type: MediaType,
    thumb_status: ThumbStatus,
    liked: bool,
    favorite: bool,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl TryFrom<RecordRow> for MediaRecord {
    type Error = CoreError;

    fn try_from(row: RecordRow) -> Result<Self> {
        let id = Uuid::parse_str(&row.id)
            .map_err(|e| CoreError::Internal(format!("corrupt media id {:?}: {e}", row.id)))?;
        Ok(MediaRecord {
            id,
            source_id: row.source_id,
            dedupe_key: row.dedupe_key,
            size: row.size,
            mtime: row.mtime,
            media_type: row.media_type,
            thumb_status: row.thumb_status,
            liked: row.liked,
            favorite: row.favorite,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MediaCatalog {
    pool: SqlitePool,
}

impl MediaCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a newly discovered file, update a changed one, or leave
    /// an unchanged one alone.
    pub async fn upsert(
        &self,
        source_id: i64,
        dedupe_key: &str,
        size: i64,
        mtime: i64,
        media_type: MediaType,
    ) -> Result<UpsertOutcome> {
        let existing = sqlx::query_as::<_, (String, i64, i64)>(
            "SELECT id, size, mtime FROM media_records WHERE source_id = ? AND dedupe_key = ?",
        )
        .bind(source_id)
        .bind(dedupe_key)
        .fetch_optional(&self.pool)
        .await?;

        let now = Utc::now();
        match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO media_records
                        (id, source_id, dedupe_key, size, mtime, media_type,
                         thumb_status, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?)
                    "#,
                )
                .bind(Uuid::new_v4().to_string())
                .bind(source_id)
                .bind(dedupe_key)
                .bind(size)
                .bind(mtime)
                .bind(media_type)
                .bind(now)
                .bind(now)
                .execute(&self.pool)
                .await?;
                Ok(UpsertOutcome::Inserted)
            }
            Some((id, old_size, old_mtime)) if old_size != size || old_mtime != mtime => {
                // Content changed under the same identity: update in
                // place and invalidate the thumbnail.
                sqlx::query(
                    r#"
                    UPDATE media_records
                    SET size = ?, mtime = ?, thumb_status = 'pending', updated_at = ?
                    WHERE id = ?
                    "#,
                )
                .bind(size)
                .bind(mtime)
                .bind(now)
                .bind(id)
                .execute(&self.pool)
                .await?;
                Ok(UpsertOutcome::Updated)
            }
            Some(_) => Ok(UpsertOutcome::Unchanged),
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<MediaRecord>> {
        let row = sqlx::query_as::<_, RecordRow>("SELECT * FROM media_records WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(MediaRecord::try_from).transpose()
    }

    /// Flip a user tag. Returns false when the record does not exist.
    pub async fn set_tag(&self, id: Uuid, tag: MediaTag, value: bool) -> Result<bool> {
        let column = match tag {
            MediaTag::Liked => "liked",
            MediaTag::Favorite => "favorite",
        };
        let result = sqlx::query(&format!(
            "UPDATE media_records SET {column} = ?, updated_at = ? WHERE id = ?"
        ))
        .bind(value)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_thumb_status(&self, id: Uuid, status: ThumbStatus) -> Result<()> {
        sqlx::query("UPDATE media_records SET thumb_status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Paginated listing with an optional tag filter and one of three
    /// orders. `Shuffle` is a deterministic permutation keyed by the
    /// session seed, so pages of one session never overlap or jump.
    pub async fn list(&self, query: &ListQuery) -> Result<ListPage> {
        let limit = query.limit.clamp(1, 500);
        let offset = query.offset.max(0);
        let tag_clause = match query.tag {
            Some(MediaTag::Liked) => " WHERE liked = 1",
            Some(MediaTag::Favorite) => " WHERE favorite = 1",
            None => "",
        };

        if query.order == ListOrder::Shuffle {
            return self.list_shuffled(tag_clause, offset, limit, query).await;
        }

        let direction = match query.order {
            ListOrder::Oldest => "ASC",
            _ => "DESC",
        };
        // Fetch one row past the page to learn whether more remain.
        let sql = format!(
            "SELECT * FROM media_records{tag_clause} \
             ORDER BY created_at {direction}, id {direction} LIMIT ? OFFSET ?"
        );
        let rows = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(limit + 1)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        let has_more = rows.len() as i64 > limit;
        let items = rows
            .into_iter()
            .take(limit as usize)
            .map(MediaRecord::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(ListPage {
            items,
            offset,
            has_more,
        })
    }

    async fn list_shuffled(
        &self,
        tag_clause: &str,
        offset: i64,
        limit: i64,
        query: &ListQuery,
    ) -> Result<ListPage> {
        let seed = query.seed.as_deref().unwrap_or("");
        let sql = format!("SELECT id FROM media_records{tag_clause}");
        let mut ids: Vec<String> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;
        ids.sort_by_cached_key(|id| shuffle_key(seed, id));

        let total = ids.len() as i64;
        let page: Vec<String> = ids
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        if page.is_empty() {
            return Ok(ListPage {
                items: Vec::new(),
                offset,
                has_more: false,
            });
        }

        let placeholders = vec!["?"; page.len()].join(", ");
        let sql = format!("SELECT * FROM media_records WHERE id IN ({placeholders})");
        let mut fetch = sqlx::query_as::<_, RecordRow>(&sql);
        for id in &page {
            fetch = fetch.bind(id);
        }
        let rows = fetch.fetch_all(&self.pool).await?;

        let mut by_id: HashMap<String, RecordRow> =
            rows.into_iter().map(|r| (r.id.clone(), r)).collect();
        let items = page
            .iter()
            .filter_map(|id| by_id.remove(id))
            .map(MediaRecord::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(ListPage {
            items,
            offset,
            has_more: offset + limit < total,
        })
    }

    pub async fn count_for_source(&self, source_id: i64) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM media_records WHERE source_id = ?")
                .bind(source_id)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    /// Delete records of a source whose dedupe keys were NOT seen by a
    /// completed walk. Used only by the explicit purge-missing mode.
    pub async fn purge_missing(&self, source_id: i64, seen: &HashSet<String>) -> Result<u64> {
        let keys: Vec<String> =
            sqlx::query_scalar("SELECT dedupe_key FROM media_records WHERE source_id = ?")
                .bind(source_id)
                .fetch_all(&self.pool)
                .await?;
        let stale: Vec<&String> = keys.iter().filter(|k| !seen.contains(*k)).collect();

        let mut purged = 0u64;
        for chunk in stale.chunks(64) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "DELETE FROM media_records WHERE source_id = ? AND dedupe_key IN ({placeholders})"
            );
            let mut q = sqlx::query(&sql).bind(source_id);
            for key in chunk {
                q = q.bind(key.as_str());
            }
            purged += q.execute(&self.pool).await?.rows_affected();
        }
        Ok(purged)
    }
}

/// Sort key for the deterministic shuffle: SHA-256 over seed and id.
fn shuffle_key(seed: &str, id: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(b"\x00");
    hasher.update(id.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn catalog_with_source() -> (MediaCatalog, i64) {
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
        (MediaCatalog::new(pool), 1)
    }

    #[tokio::test]
    async fn upsert_distinguishes_insert_update_unchanged() {
        let (catalog, src) = catalog_with_source().await;

        let first = catalog
            .upsert(src, "/m/a.jpg", 100, 10, MediaType::Image)
            .await
            .unwrap();
        assert_eq!(first, UpsertOutcome::Inserted);

        let again = catalog
            .upsert(src, "/m/a.jpg", 100, 10, MediaType::Image)
            .await
            .unwrap();
        assert_eq!(again, UpsertOutcome::Unchanged);

        let changed = catalog
            .upsert(src, "/m/a.jpg", 120, 11, MediaType::Image)
            .await
            .unwrap();
        assert_eq!(changed, UpsertOutcome::Updated);

        // A changed file keeps one row and invalidates its thumbnail.
        let page = catalog.list(&ListQuery { limit: 10, ..Default::default() }).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].size, 120);
        assert_eq!(page.items[0].thumb_status, ThumbStatus::Pending);
    }

    #[tokio::test]
    async fn pagination_reports_has_more() {
        let (catalog, src) = catalog_with_source().await;
        for i in 0..5 {
            catalog
                .upsert(src, &format!("/m/{i}.jpg"), 10, i, MediaType::Image)
                .await
                .unwrap();
        }

        let first = catalog
            .list(&ListQuery { offset: 0, limit: 2, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(first.has_more);

        let last = catalog
            .list(&ListQuery { offset: 4, limit: 2, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(last.items.len(), 1);
        assert!(!last.has_more);
    }

    #[tokio::test]
    async fn shuffle_is_deterministic_per_seed_and_paginates_without_overlap() {
        let (catalog, src) = catalog_with_source().await;
        for i in 0..10 {
            catalog
                .upsert(src, &format!("/m/{i}.jpg"), 10, i, MediaType::Image)
                .await
                .unwrap();
        }

        let q = |offset| ListQuery {
            offset,
            limit: 5,
            order: ListOrder::Shuffle,
            seed: Some("abc".into()),
            ..Default::default()
        };
        let a1 = catalog.list(&q(0)).await.unwrap();
        let a2 = catalog.list(&q(0)).await.unwrap();
        let ids1: Vec<_> = a1.items.iter().map(|r| r.id).collect();
        let ids2: Vec<_> = a2.items.iter().map(|r| r.id).collect();
        assert_eq!(ids1, ids2);

        let tail = catalog.list(&q(5)).await.unwrap();
        assert!(!tail.has_more);
        let tail_ids: Vec<_> = tail.items.iter().map(|r| r.id).collect();
        assert!(ids1.iter().all(|id| !tail_ids.contains(id)));

        let other_seed = catalog
            .list(&ListQuery {
                seed: Some("xyz".into()),
                ..q(0)
            })
            .await
            .unwrap();
        // Ten records make an identical permutation vanishingly unlikely.
        let other_ids: Vec<_> = other_seed.items.iter().map(|r| r.id).collect();
        assert_ne!(ids1, other_ids);
    }

    #[tokio::test]
    async fn tag_filter_and_toggle() {
        let (catalog, src) = catalog_with_source().await;
        catalog
            .upsert(src, "/m/a.jpg", 10, 1, MediaType::Image)
            .await
            .unwrap();
        catalog
            .upsert(src, "/m/b.jpg", 10, 2, MediaType::Image)
            .await
            .unwrap();

        let all = catalog
            .list(&ListQuery { limit: 10, ..Default::default() })
            .await
            .unwrap();
        let id = all.items[0].id;
        assert!(catalog.set_tag(id, MediaTag::Favorite, true).await.unwrap());

        let favorites = catalog
            .list(&ListQuery {
                limit: 10,
                tag: Some(MediaTag::Favorite),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(favorites.items.len(), 1);
        assert_eq!(favorites.items[0].id, id);

        assert!(
            !catalog
                .set_tag(Uuid::new_v4(), MediaTag::Liked, true)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn purge_missing_only_touches_unseen_keys() {
        let (catalog, src) = catalog_with_source().await;
        catalog
            .upsert(src, "/m/keep.jpg", 10, 1, MediaType::Image)
            .await
            .unwrap();
        catalog
            .upsert(src, "/m/gone.jpg", 10, 2, MediaType::Image)
            .await
            .unwrap();

        let seen: HashSet<String> = ["/m/keep.jpg".to_string()].into_iter().collect();
        let purged = catalog.purge_missing(src, &seen).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(catalog.count_for_source(src).await.unwrap(), 1);
    }
}
