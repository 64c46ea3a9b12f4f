use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::StoreError;
use crate::model::{AnalysisRun, AnalysisRunParams, AnalysisRunStatus, RunScope, TriggeredBy};

pub struct AnalysisRunsRepo<'a> {
    pool: &'a SqlitePool,
}

impl<'a> AnalysisRunsRepo<'a> {
    pub(super) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: i64) -> Result<AnalysisRun, StoreError> {
        sqlx::query_as::<_, AnalysisRun>("SELECT * FROM analysis_runs WHERE id = ?")
            .bind(id)
            .fetch_one(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "analysis_runs.get"))
    }

    pub async fn create_pending(
        &self,
        scope: &RunScope,
        params: &AnalysisRunParams,
        cost_estimate_usd: f64,
        queued_count: i64,
    ) -> Result<i64, StoreError> {
        let scope_json = serde_json::to_string(scope)
            .map_err(|e| StoreError::Fatal(format!("analysis_runs.create_pending.scope: {e}")))?;

        sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO analysis_runs
                (status, scope_json, model_tag, rate_per_second, item_limit, override_existing,
                 triggered_by, queued_count, cost_estimate_usd)
            VALUES ('pending', ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(scope_json)
        .bind(&params.model_tag)
        .bind(params.rate_per_second)
        .bind(params.limit as i64)
        .bind(params.override_existing)
        .bind(params.triggered_by.to_string())
        .bind(queued_count)
        .bind(cost_estimate_usd)
        .fetch_one(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "analysis_runs.create_pending"))
    }

    /// Compare-and-set transition: succeeds only if the row's current
    /// status is one of `from_states`. Returns `Ok(true)` if the CAS
    /// applied, `Ok(false)` if some other writer already moved it.
    pub async fn transition(
        &self,
        run_id: i64,
        from_states: &[AnalysisRunStatus],
        to_state: AnalysisRunStatus,
    ) -> Result<bool, StoreError> {
        let from_strs: Vec<String> = from_states.iter().map(|s| s.to_string()).collect();
        let placeholders = from_strs.iter().map(|_| "?").collect::<Vec<_>>().join(",");

        let timestamp_clause = match to_state {
            AnalysisRunStatus::Queued => ", confirmed_at = datetime('now')",
            AnalysisRunStatus::Running => ", started_at = COALESCE(started_at, datetime('now'))",
            AnalysisRunStatus::Completed
            | AnalysisRunStatus::Failed
            | AnalysisRunStatus::Cancelled => ", completed_at = datetime('now')",
            _ => "",
        };

        let sql = format!(
            "UPDATE analysis_runs SET status = ?{timestamp_clause} WHERE id = ? AND status IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql).bind(to_state.to_string()).bind(run_id);
        for s in &from_strs {
            query = query.bind(s);
        }

        let result = query
            .execute(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "analysis_runs.transition"))?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn set_last_error(&self, run_id: i64, message: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE analysis_runs SET last_error = ? WHERE id = ?")
            .bind(message)
            .bind(run_id)
            .execute(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "analysis_runs.set_last_error"))?;
        Ok(())
    }

    /// Atomic increment of the run's progress counters and accumulated
    /// cost, used by the worker pool after each item completes or fails.
    pub async fn increment_counters(
        &self,
        run_id: i64,
        processed_delta: i64,
        failed_delta: i64,
        cost_delta: f64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE analysis_runs
            SET processed_count = processed_count + ?,
                failed_count = failed_count + ?,
                actual_cost_usd = actual_cost_usd + ?
            WHERE id = ?
            "#,
        )
        .bind(processed_delta)
        .bind(failed_delta)
        .bind(cost_delta)
        .bind(run_id)
        .execute(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "analysis_runs.increment_counters"))?;
        Ok(())
    }

    pub async fn count_running(&self) -> Result<i64, StoreError> {
        sqlx::query_scalar("SELECT COUNT(*) FROM analysis_runs WHERE status = 'running'")
            .fetch_one(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "analysis_runs.count_running"))
    }

    pub async fn count_since(&self, triggered_by: TriggeredBy, since: chrono::DateTime<Utc>) -> Result<i64, StoreError> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM analysis_runs WHERE triggered_by = ? AND created_at >= ? AND status != 'pending'",
        )
        .bind(triggered_by.to_string())
        .bind(since)
        .fetch_one(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "analysis_runs.count_since"))
    }

    pub async fn waiting_queue(&self) -> Result<Vec<AnalysisRun>, StoreError> {
        sqlx::query_as::<_, AnalysisRun>(
            "SELECT * FROM analysis_runs WHERE status = 'queued' ORDER BY confirmed_at ASC",
        )
        .fetch_all(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "analysis_runs.waiting_queue"))
    }

    pub async fn running_runs(&self) -> Result<Vec<AnalysisRun>, StoreError> {
        sqlx::query_as::<_, AnalysisRun>("SELECT * FROM analysis_runs WHERE status = 'running'")
            .fetch_all(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "analysis_runs.running_runs"))
    }

    pub async fn non_terminal_runs(&self) -> Result<Vec<AnalysisRun>, StoreError> {
        sqlx::query_as::<_, AnalysisRun>(
            "SELECT * FROM analysis_runs WHERE status IN ('pending','queued','running','paused')",
        )
        .fetch_all(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "analysis_runs.non_terminal_runs"))
    }
}
