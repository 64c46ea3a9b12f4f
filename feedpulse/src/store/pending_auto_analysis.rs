use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::error::StoreError;
use crate::model::PendingAutoAnalysis;

pub struct PendingAutoAnalysisRepo<'a> {
    pool: &'a SqlitePool,
}

impl<'a> PendingAutoAnalysisRepo<'a> {
    pub(super) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, feed_id: i64, item_ids: &[i64]) -> Result<i64, StoreError> {
        let item_ids_json = serde_json::to_string(item_ids)
            .map_err(|e| StoreError::Fatal(format!("pending_auto_analysis.create.json: {e}")))?;
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO pending_auto_analysis (feed_id, item_ids_json, status) VALUES (?, ?, 'pending') RETURNING id",
        )
        .bind(feed_id)
        .bind(item_ids_json)
        .fetch_one(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "pending_auto_analysis.create"))
    }

    /// Count existing pending+completed jobs for a feed since `since`
    /// (spec §9 Open Question: daily cap counts pending+completed, not
    /// completed-only).
    pub async fn count_pending_and_completed_since(
        &self,
        feed_id: i64,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM pending_auto_analysis
            WHERE feed_id = ? AND created_at >= ? AND status IN ('pending', 'processing', 'completed')
            "#,
        )
        .bind(feed_id)
        .bind(since)
        .fetch_one(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "pending_auto_analysis.count_pending_and_completed_since"))
    }

    pub async fn expire_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE pending_auto_analysis SET status = 'expired' WHERE created_at < ? AND status = 'pending'",
        )
        .bind(cutoff)
        .execute(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "pending_auto_analysis.expire_older_than"))?;
        Ok(result.rows_affected())
    }

    pub async fn pending_ordered(&self) -> Result<Vec<PendingAutoAnalysis>, StoreError> {
        sqlx::query_as::<_, PendingAutoAnalysis>(
            "SELECT * FROM pending_auto_analysis WHERE status = 'pending' ORDER BY created_at ASC",
        )
        .fetch_all(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "pending_auto_analysis.pending_ordered"))
    }

    /// CAS transition used so two processor ticks never race on the same row.
    pub async fn transition(
        &self,
        id: i64,
        from_statuses: &[&str],
        to_status: &str,
    ) -> Result<bool, StoreError> {
        let placeholders = from_statuses.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "UPDATE pending_auto_analysis SET status = ? WHERE id = ? AND status IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql).bind(to_status).bind(id);
        for s in from_statuses {
            query = query.bind(*s);
        }
        let result = query
            .execute(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "pending_auto_analysis.transition"))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_failed(&self, id: i64, reason: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE pending_auto_analysis SET status = 'failed', error_message = ?, processed_at = datetime('now') WHERE id = ?",
        )
        .bind(reason)
        .bind(id)
        .execute(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "pending_auto_analysis.mark_failed"))?;
        Ok(())
    }

    pub async fn mark_completed(&self, id: i64, analysis_run_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE pending_auto_analysis SET status = 'completed', analysis_run_id = ?, processed_at = datetime('now') WHERE id = ?",
        )
        .bind(analysis_run_id)
        .bind(id)
        .execute(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "pending_auto_analysis.mark_completed"))?;
        Ok(())
    }

    pub async fn revert_to_pending(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE pending_auto_analysis SET status = 'pending' WHERE id = ?")
            .bind(id)
            .execute(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "pending_auto_analysis.revert_to_pending"))?;
        Ok(())
    }
}
