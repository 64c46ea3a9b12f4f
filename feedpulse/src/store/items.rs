use sqlx::SqlitePool;

use crate::error::StoreError;
use crate::model::{Item, NewItem, UpsertOutcome};

pub struct ItemsRepo<'a> {
    pool: &'a SqlitePool,
}

impl<'a> ItemsRepo<'a> {
    pub(super) fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Atomic upsert by `content_hash`: duplicate inserts are silently
    /// skipped and reported as `Existing` (spec §3/§4.1), never surfaced as
    /// an error to the caller.
    pub async fn upsert_by_content_hash(
        &self,
        item: &NewItem,
    ) -> Result<(UpsertOutcome, i64), StoreError> {
        if let Some(existing_id) =
            sqlx::query_scalar::<_, i64>("SELECT id FROM items WHERE content_hash = ?")
                .bind(&item.content_hash)
                .fetch_optional(self.pool)
                .await
                .map_err(|e| StoreError::from_sqlx(e, "items.upsert.lookup"))?
        {
            return Ok((UpsertOutcome::Existing, existing_id));
        }

        let inserted = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO items (feed_id, title, link, description, content, author, published_at, guid, content_hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (content_hash) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(item.feed_id)
        .bind(&item.title)
        .bind(&item.link)
        .bind(&item.description)
        .bind(&item.content)
        .bind(&item.author)
        .bind(item.published_at)
        .bind(&item.guid)
        .bind(&item.content_hash)
        .fetch_optional(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "items.upsert.insert"))?;

        match inserted {
            Some(id) => Ok((UpsertOutcome::Inserted, id)),
            None => {
                // Lost a race against a concurrent insert between the lookup
                // and the insert above; re-read the winner's id.
                let id = sqlx::query_scalar::<_, i64>(
                    "SELECT id FROM items WHERE content_hash = ?",
                )
                .bind(&item.content_hash)
                .fetch_one(self.pool)
                .await
                .map_err(|e| StoreError::from_sqlx(e, "items.upsert.reread"))?;
                Ok((UpsertOutcome::Existing, id))
            }
        }
    }

    pub async fn get(&self, id: i64) -> Result<Item, StoreError> {
        sqlx::query_as::<_, Item>("SELECT * FROM items WHERE id = ?")
            .bind(id)
            .fetch_one(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "items.get"))
    }

    pub async fn by_ids(&self, ids: &[i64]) -> Result<Vec<Item>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!("SELECT * FROM items WHERE id IN ({placeholders})");
        let mut query = sqlx::query_as::<_, Item>(&sql);
        for id in ids {
            query = query.bind(id);
        }
        query
            .fetch_all(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "items.by_ids"))
    }

    pub async fn by_feed(&self, feed_id: i64) -> Result<Vec<Item>, StoreError> {
        sqlx::query_as::<_, Item>(
            "SELECT * FROM items WHERE feed_id = ? ORDER BY published_at DESC",
        )
        .bind(feed_id)
        .fetch_all(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "items.by_feed"))
    }

    pub async fn all_ids(&self, limit: u32) -> Result<Vec<i64>, StoreError> {
        sqlx::query_scalar::<_, i64>("SELECT id FROM items ORDER BY id ASC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "items.all_ids"))
    }

    pub async fn ids_in_time_range(
        &self,
        start: chrono::DateTime<chrono::Utc>,
        end: chrono::DateTime<chrono::Utc>,
        limit: u32,
    ) -> Result<Vec<i64>, StoreError> {
        sqlx::query_scalar::<_, i64>(
            "SELECT id FROM items WHERE published_at >= ? AND published_at <= ? ORDER BY published_at ASC LIMIT ?",
        )
        .bind(start)
        .bind(end)
        .bind(limit as i64)
        .fetch_all(self.pool)
        .await
        .map_err(|e| StoreError::from_sqlx(e, "items.ids_in_time_range"))
    }

    pub async fn ids_for_feeds(&self, feed_ids: &[i64], limit: u32) -> Result<Vec<i64>, StoreError> {
        if feed_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = feed_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT id FROM items WHERE feed_id IN ({placeholders}) ORDER BY id ASC LIMIT ?"
        );
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for id in feed_ids {
            query = query.bind(id);
        }
        query = query.bind(limit as i64);
        query
            .fetch_all(self.pool)
            .await
            .map_err(|e| StoreError::from_sqlx(e, "items.ids_for_feeds"))
    }
}
