use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::StoreError;
use crate::model::{FetchLog, FetchLogStatus};

pub struct FetchLogsRepo<'a> {
    pool: &'a SqlitePool,
}

impl<'a> FetchLogsRepo<'a> {
    pub(super) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn start(&self, feed_id: i64, started_at: DateTime<Utc>) -> Result<i64, StoreError> {
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO fetch_logs (feed_id, started_at, status) VALUES (?, ?, 'pending') RETURNING id",
        )
        .bind(feed_id)
        .bind(started_at)
        .fetch_one(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "fetch_logs.start"))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn complete(
        &self,
        id: i64,
        status: FetchLogStatus,
        items_found: i64,
        items_new: i64,
        items_dropped: i64,
        error_message: Option<&str>,
        response_time_ms: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE fetch_logs
            SET completed_at = datetime('now'), status = ?, items_found = ?, items_new = ?,
                items_dropped = ?, error_message = ?, response_time_ms = ?
            WHERE id = ?
            "#,
        )
        .bind(status.to_string())
        .bind(items_found)
        .bind(items_new)
        .bind(items_dropped)
        .bind(error_message)
        .bind(response_time_ms)
        .bind(id)
        .execute(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "fetch_logs.complete"))?;
        Ok(())
    }

    pub async fn recent_for_feed(&self, feed_id: i64, limit: u32) -> Result<Vec<FetchLog>, StoreError> {
        sqlx::query_as::<_, FetchLog>(
            "SELECT * FROM fetch_logs WHERE feed_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(feed_id)
        .bind(limit as i64)
        .fetch_all(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "fetch_logs.recent_for_feed"))
    }

    /// Rolling success ratio over FetchLog rows started within `since`.
    pub async fn uptime_since(&self, feed_id: i64, since: DateTime<Utc>) -> Result<f64, StoreError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM fetch_logs WHERE feed_id = ? AND started_at >= ?",
        )
        .bind(feed_id)
        .bind(since)
        .fetch_one(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "fetch_logs.uptime_since.total"))?;

        if total == 0 {
            return Ok(1.0);
        }

        let successes: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM fetch_logs WHERE feed_id = ? AND started_at >= ? AND status = 'success'",
        )
        .bind(feed_id)
        .bind(since)
        .fetch_one(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "fetch_logs.uptime_since.successes"))?;

        Ok(successes as f64 / total as f64)
    }
}
