use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::StoreError;
use crate::model::Feed;

pub struct FeedsRepo<'a> {
    pool: &'a SqlitePool,
}

impl<'a> FeedsRepo<'a> {
    pub(super) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: i64) -> Result<Feed, StoreError> {
        sqlx::query_as::<_, Feed>("SELECT * FROM feeds WHERE id = ?")
            .bind(id)
            .fetch_one(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "feeds.get"))
    }

    pub async fn create(
        &self,
        url: &str,
        title: Option<&str>,
        fetch_interval_minutes: i64,
        auto_analyze_enabled: bool,
    ) -> Result<i64, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::from_sqlx(e, "feeds.create.begin"))?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO feeds (url, title, fetch_interval_minutes, next_fetch_at, auto_analyze_enabled)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(url)
        .bind(title)
        .bind(fetch_interval_minutes)
        .bind(Utc::now())
        .bind(auto_analyze_enabled)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "feeds.create.insert"))?;

        // Each active feed has exactly one FeedHealth row, created eagerly
        // on feed creation (spec §3 invariant).
        sqlx::query("INSERT INTO feed_health (feed_id) VALUES (?)")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "feeds.create.health"))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::from_sqlx(e, "feeds.create.commit"))?;

        Ok(id)
    }

    /// Feeds where `next_fetch_at <= now AND status='active'`, ordered by
    /// `next_fetch_at` ascending, reserving each to the caller by advancing
    /// `next_fetch_at` via compare-and-set (spec §4.3 claim protocol).
    /// `exclude_ids` skips feeds already in flight from a previous claim.
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        exclude_ids: &[i64],
    ) -> Result<Vec<Feed>, StoreError> {
        let candidates: Vec<Feed> = sqlx::query_as::<_, Feed>(
            r#"
            SELECT * FROM feeds
            WHERE status = 'active'
              AND (next_fetch_at IS NULL OR next_fetch_at <= ?)
            ORDER BY next_fetch_at ASC
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind((limit as i64).max(0) + exclude_ids.len() as i64)
        .fetch_all(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "feeds.claim_due.select"))?;

        let mut claimed = Vec::new();
        for feed in candidates {
            if exclude_ids.contains(&feed.id) {
                continue;
            }
            if claimed.len() as u32 >= limit {
                break;
            }
            let reserved_next = now + chrono::Duration::minutes(feed.fetch_interval_minutes.max(1));
            let prior_next_fetch_at = feed.next_fetch_at;
            // CAS: only succeeds if next_fetch_at still matches what we read.
            let result = sqlx::query(
                r#"
                UPDATE feeds
                SET next_fetch_at = ?
                WHERE id = ?
                  AND ((next_fetch_at IS NULL AND ? IS NULL) OR next_fetch_at = ?)
                "#,
            )
            .bind(reserved_next)
            .bind(feed.id)
            .bind(prior_next_fetch_at)
            .bind(prior_next_fetch_at)
            .execute(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "feeds.claim_due.cas"))?;

            if result.rows_affected() == 1 {
                claimed.push(feed);
            }
            // CAS failure means another scheduler instance won the claim; skip.
        }

        Ok(claimed)
    }

    pub async fn set_next_fetch_at(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE feeds SET next_fetch_at = ?, last_fetched_at = ? WHERE id = ?")
            .bind(at)
            .bind(Utc::now())
            .bind(id)
            .execute(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "feeds.set_next_fetch_at"))?;
        Ok(())
    }

    pub async fn mark_error(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE feeds SET status = 'error' WHERE id = ?")
            .bind(id)
            .execute(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "feeds.mark_error"))?;
        Ok(())
    }

    /// Admin action restoring an `error` feed to `active`.
    pub async fn restore_active(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE feeds SET status = 'active' WHERE id = ?")
            .bind(id)
            .execute(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "feeds.restore_active"))?;
        Ok(())
    }

    pub async fn by_ids(&self, ids: &[i64]) -> Result<Vec<Feed>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("SELECT * FROM feeds WHERE id IN ({placeholders})");
        let mut query = sqlx::query_as::<_, Feed>(&sql);
        for id in ids {
            query = query.bind(id);
        }
        query
            .fetch_all(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "feeds.by_ids"))
    }
}
