use sqlx::SqlitePool;

use crate::error::StoreError;
use crate::model::FeatureFlagRow;

/// Persisted checkpoint for the in-memory `FeatureFlags` registry, so
/// rollout percentage and emergency-trip state survive a restart.
pub struct FeatureFlagsRepo<'a> {
    pool: &'a SqlitePool,
}

impl<'a> FeatureFlagsRepo<'a> {
    pub(super) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn all(&self) -> Result<Vec<FeatureFlagRow>, StoreError> {
        sqlx::query_as::<_, FeatureFlagRow>("SELECT * FROM feature_flags")
            .fetch_all(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "feature_flags.all"))
    }

    pub async fn checkpoint(&self, name: &str, status: &str, rollout_percentage: u8) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO feature_flags (name, status, rollout_percentage, updated_at)
            VALUES (?, ?, ?, datetime('now'))
            ON CONFLICT (name) DO UPDATE SET
                status = excluded.status,
                rollout_percentage = excluded.rollout_percentage,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(name)
        .bind(status)
        .bind(rollout_percentage as i64)
        .execute(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "feature_flags.checkpoint"))?;
        Ok(())
    }
}
