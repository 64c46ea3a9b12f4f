use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::StoreError;
use crate::model::{FeedHealth, FEED_HEALTH_EWMA_WINDOW};

pub struct FeedHealthRepo<'a> {
    pool: &'a SqlitePool,
}

impl<'a> FeedHealthRepo<'a> {
    pub(super) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, feed_id: i64) -> Result<FeedHealth, StoreError> {
        sqlx::query_as::<_, FeedHealth>("SELECT * FROM feed_health WHERE feed_id = ?")
            .bind(feed_id)
            .fetch_one(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "feed_health.get"))
    }

    /// Apply one fetch attempt's outcome: EWMA over `ok_ratio` (window N=50),
    /// reset/increment `consecutive_failures`, recompute 24h/7d uptime from
    /// FetchLog. Exactly one FeedHealth update per attempt (spec §4.4).
    pub async fn record_attempt(
        &self,
        feed_id: i64,
        success: bool,
        response_time_ms: i64,
        uptime_24h: f64,
        uptime_7d: f64,
    ) -> Result<(), StoreError> {
        let current = self.get(feed_id).await?;

        let outcome = if success { 1.0 } else { 0.0 };
        let ok_ratio = ((FEED_HEALTH_EWMA_WINDOW - 1.0) * current.ok_ratio + outcome)
            / FEED_HEALTH_EWMA_WINDOW;

        let consecutive_failures = if success {
            0
        } else {
            current.consecutive_failures + 1
        };

        let avg_response_time_ms = if current.avg_response_time_ms == 0.0 {
            response_time_ms as f64
        } else {
            (current.avg_response_time_ms * (FEED_HEALTH_EWMA_WINDOW - 1.0)
                + response_time_ms as f64)
                / FEED_HEALTH_EWMA_WINDOW
        };

        let now = Utc::now();
        let (last_success_at, last_failure_at) = if success {
            (Some(now), current.last_failure_at)
        } else {
            (current.last_success_at, Some(now))
        };

        sqlx::query(
            r#"
            UPDATE feed_health
            SET ok_ratio = ?, consecutive_failures = ?, avg_response_time_ms = ?,
                last_success_at = ?, last_failure_at = ?, uptime_24h = ?, uptime_7d = ?
            WHERE feed_id = ?
            "#,
        )
        .bind(ok_ratio)
        .bind(consecutive_failures)
        .bind(avg_response_time_ms)
        .bind(last_success_at)
        .bind(last_failure_at)
        .bind(uptime_24h)
        .bind(uptime_7d)
        .bind(feed_id)
        .execute(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "feed_health.record_attempt"))?;

        Ok(())
    }

    pub async fn create_if_missing(&self, feed_id: i64) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO feed_health (feed_id) VALUES (?)")
            .bind(feed_id)
            .execute(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "feed_health.create_if_missing"))?;
        Ok(())
    }

    #[allow(dead_code)]
    pub async fn last_success_before(&self, feed_id: i64) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.get(feed_id).await?.last_success_at)
    }
}
