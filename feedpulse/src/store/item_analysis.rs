use sqlx::SqlitePool;

use crate::error::StoreError;
use crate::model::{AnalysisResult, ItemAnalysisRow};

pub struct ItemAnalysisRepo<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ItemAnalysisRepo<'a> {
    pub(super) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Overwrite-previous upsert: an item has at most one analysis, latest
    /// wins on re-analysis (spec §3 invariant).
    pub async fn upsert(
        &self,
        item_id: i64,
        result: &AnalysisResult,
        model_tag: &str,
    ) -> Result<(), StoreError> {
        let sentiment_json = serde_json::to_string(&result.sentiment)
            .map_err(|e| StoreError::Fatal(format!("item_analysis.upsert.sentiment: {e}")))?;
        let impact_json = serde_json::to_string(&result.impact)
            .map_err(|e| StoreError::Fatal(format!("item_analysis.upsert.impact: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO item_analysis (item_id, sentiment_json, impact_json, model_tag, updated_at)
            VALUES (?, ?, ?, ?, datetime('now'))
            ON CONFLICT (item_id) DO UPDATE SET
                sentiment_json = excluded.sentiment_json,
                impact_json = excluded.impact_json,
                model_tag = excluded.model_tag,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(item_id)
        .bind(sentiment_json)
        .bind(impact_json)
        .bind(model_tag)
        .execute(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "item_analysis.upsert"))?;

        Ok(())
    }

    pub async fn get(&self, item_id: i64) -> Result<ItemAnalysisRow, StoreError> {
        sqlx::query_as::<_, ItemAnalysisRow>("SELECT * FROM item_analysis WHERE item_id = ?")
            .bind(item_id)
            .fetch_one(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "item_analysis.get"))
    }

    /// Filters `item_ids` down to those that do NOT already have an
    /// analysis, used by preview when `override_existing=false`.
    pub async fn without_analysis(&self, item_ids: &[i64]) -> Result<Vec<i64>, StoreError> {
        if item_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = item_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT id FROM items WHERE id IN ({placeholders}) AND id NOT IN (SELECT item_id FROM item_analysis)"
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for id in item_ids {
            query = query.bind(id);
        }
        query
            .fetch_all(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "item_analysis.without_analysis"))
    }

    pub async fn count_existing(&self, item_ids: &[i64]) -> Result<i64, StoreError> {
        if item_ids.is_empty() {
            return Ok(0);
        }
        let placeholders = item_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT COUNT(*) FROM item_analysis WHERE item_id IN ({placeholders})"
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for id in item_ids {
            query = query.bind(id);
        }
        query
            .fetch_one(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "item_analysis.count_existing"))
    }
}
