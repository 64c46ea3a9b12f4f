//! AutoAnalysisBridge: translates `FeedFetched` events into
//! `PendingAutoAnalysis` jobs, subject to the per-feed daily cap.

use chrono::Utc;
use tracing::{info, warn};

use crate::events::{Event, EventBus};
use crate::model::FeedFetched;
use crate::store::Store;

pub struct AutoAnalysisBridge {
    store: Store,
    max_items_per_job: u32,
    max_daily_per_feed: u32,
}

impl AutoAnalysisBridge {
    pub fn new(store: Store, max_items_per_job: u32, max_daily_per_feed: u32) -> Self {
        Self {
            store,
            max_items_per_job,
            max_daily_per_feed,
        }
    }

    /// Subscribe to the event bus and process `FeedFetched` events until the
    /// sender side is dropped (process shutdown).
    pub async fn run(&self, events: EventBus) {
        let mut receiver = events.subscribe();
        loop {
            match receiver.recv().await {
                Ok(Event::FeedFetched(event)) => {
                    if let Err(e) = self.handle(event).await {
                        tracing::error!(error = %e, "auto-analysis bridge failed to handle event");
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "auto-analysis bridge lagged behind event bus");
                }
            }
        }
    }

    pub async fn handle(&self, event: FeedFetched) -> anyhow::Result<()> {
        if event.new_item_ids.is_empty() {
            return Ok(());
        }

        let feed = self.store.feeds().get(event.feed_id).await?;
        if !feed.auto_analyze_enabled {
            return Ok(());
        }

        let since = Utc::now() - chrono::Duration::hours(24);
        let existing = self
            .store
            .pending_auto_analysis()
            .count_pending_and_completed_since(event.feed_id, since)
            .await?;
        if existing as u32 >= self.max_daily_per_feed {
            warn!(
                feed_id = event.feed_id,
                existing, cap = self.max_daily_per_feed,
                "auto-analysis daily cap reached, discarding new-items event"
            );
            return Ok(());
        }

        for batch in event.new_item_ids.chunks(self.max_items_per_job as usize) {
            let id = self
                .store
                .pending_auto_analysis()
                .create(event.feed_id, batch)
                .await?;
            info!(feed_id = event.feed_id, pending_id = id, batch_size = batch.len(), "created pending auto-analysis job");
        }

        Ok(())
    }
}
