use sqlx::SqlitePool;

use crate::error::StoreError;
use crate::model::AnalysisRunItem;

pub struct AnalysisRunItemsRepo<'a> {
    pool: &'a SqlitePool,
}

impl<'a> AnalysisRunItemsRepo<'a> {
    pub(super) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_queued_batch(&self, run_id: i64, item_ids: &[i64]) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::from_sqlx(e, "analysis_run_items.insert_queued_batch.begin"))?;
        for item_id in item_ids {
            sqlx::query(
                "INSERT INTO analysis_run_items (run_id, item_id, state) VALUES (?, ?, 'queued')",
            )
            .bind(run_id)
            .bind(item_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "analysis_run_items.insert_queued_batch"))?;
        }
        tx.commit()
            .await
            .map_err(|e| StoreError::from_sqlx(e, "analysis_run_items.insert_queued_batch.commit"))?;
        Ok(())
    }

    /// Pull up to `limit` queued items for a run, in id-ascending order, and
    /// CAS-transition each to `processing` before handing it to a worker
    /// (spec §4.8 step 2).
    pub async fn claim_queued(&self, run_id: i64, limit: u32) -> Result<Vec<i64>, StoreError> {
        let candidates: Vec<i64> = sqlx::query_scalar(
            "SELECT item_id FROM analysis_run_items WHERE run_id = ? AND state = 'queued' ORDER BY item_id ASC LIMIT ?",
        )
        .bind(run_id)
        .bind(limit as i64)
        .fetch_all(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "analysis_run_items.claim_queued.select"))?;

        let mut claimed = Vec::new();
        for item_id in candidates {
            let result = sqlx::query(
                "UPDATE analysis_run_items SET state = 'processing', started_at = datetime('now') WHERE run_id = ? AND item_id = ? AND state = 'queued'",
            )
            .bind(run_id)
            .bind(item_id)
            .execute(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "analysis_run_items.claim_queued.cas"))?;

            if result.rows_affected() == 1 {
                claimed.push(item_id);
            }
        }
        Ok(claimed)
    }

    pub async fn transition(
        &self,
        run_id: i64,
        item_id: i64,
        from_states: &[&str],
        to_state: &str,
        tokens_used: Option<i64>,
        cost_usd: Option<f64>,
        error_message: Option<&str>,
    ) -> Result<bool, StoreError> {
        let placeholders = from_states.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let completed_clause = match to_state {
            "completed" | "failed" | "skipped" => ", completed_at = datetime('now')",
            _ => "",
        };
        let sql = format!(
            "UPDATE analysis_run_items SET state = ?, tokens_used = COALESCE(?, tokens_used), \
             cost_usd = COALESCE(?, cost_usd), error_message = COALESCE(?, error_message){completed_clause} \
             WHERE run_id = ? AND item_id = ? AND state IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql)
            .bind(to_state)
            .bind(tokens_used)
            .bind(cost_usd)
            .bind(error_message)
            .bind(run_id)
            .bind(item_id);
        for s in from_states {
            query = query.bind(*s);
        }

        let result = query
            .execute(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "analysis_run_items.transition"))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn counts_by_state(&self, run_id: i64) -> Result<Vec<(String, i64)>, StoreError> {
        sqlx::query_as(
            "SELECT state, COUNT(*) FROM analysis_run_items WHERE run_id = ? GROUP BY state",
        )
        .bind(run_id)
        .fetch_all(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "analysis_run_items.counts_by_state"))
    }

    pub async fn total_cost(&self, run_id: i64) -> Result<f64, StoreError> {
        sqlx::query_scalar(
            "SELECT COALESCE(SUM(cost_usd), 0.0) FROM analysis_run_items WHERE run_id = ?",
        )
        .bind(run_id)
        .fetch_one(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "analysis_run_items.total_cost"))
    }

    pub async fn all_for_run(&self, run_id: i64) -> Result<Vec<AnalysisRunItem>, StoreError> {
        sqlx::query_as::<_, AnalysisRunItem>(
            "SELECT * FROM analysis_run_items WHERE run_id = ? ORDER BY item_id ASC",
        )
        .bind(run_id)
        .fetch_all(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "analysis_run_items.all_for_run"))
    }
}
