//! PendingAnalysisProcessor: periodic sweep that drains pending
//! auto-analysis jobs into real AnalysisRuns.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::model::{AnalysisRunParams, RunScope, TriggeredBy};
use crate::run_manager::{AnalysisRunManager, RunManagerError};
use crate::store::Store;

pub struct PendingAnalysisProcessor {
    store: Store,
    run_manager: Arc<AnalysisRunManager>,
    tick: Duration,
    auto_default_model_tag: String,
    auto_rate_per_second: f64,
    max_daily_per_feed: u32,
}

impl PendingAnalysisProcessor {
    pub fn new(
        store: Store,
        run_manager: Arc<AnalysisRunManager>,
        tick_seconds: u64,
        auto_default_model_tag: String,
        auto_rate_per_second: f64,
        max_daily_per_feed: u32,
    ) -> Self {
        Self {
            store,
            run_manager,
            tick: Duration::from_secs(tick_seconds),
            auto_default_model_tag,
            auto_rate_per_second,
            max_daily_per_feed,
        }
    }

    pub async fn run(&self, shutdown: Arc<Notify>) {
        loop {
            if let Err(e) = self.sweep_once().await {
                error!(error = %e, "pending-analysis sweep failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.tick) => {}
                _ = shutdown.notified() => {
                    info!("pending-analysis processor: shutdown requested, exiting loop");
                    break;
                }
            }
        }
    }

    pub async fn sweep_once(&self) -> anyhow::Result<()> {
        let cutoff = Utc::now() - chrono::Duration::hours(24);
        let expired = self.store.pending_auto_analysis().expire_older_than(cutoff).await?;
        if expired > 0 {
            info!(expired, "expired stale pending auto-analysis jobs");
        }

        for job in self.store.pending_auto_analysis().pending_ordered().await? {
            let feed = match self.store.feeds().get(job.feed_id).await {
                Ok(f) => f,
                Err(e) => {
                    warn!(job_id = job.id, error = %e, "feed missing for pending job, marking failed");
                    self.store.pending_auto_analysis().mark_failed(job.id, "feed not found").await?;
                    continue;
                }
            };

            if !feed.auto_analyze_enabled {
                self.store
                    .pending_auto_analysis()
                    .mark_failed(job.id, "auto_analyze_enabled is now false")
                    .await?;
                continue;
            }

            let since = Utc::now() - chrono::Duration::hours(24);
            let existing = self
                .store
                .pending_auto_analysis()
                .count_pending_and_completed_since(job.feed_id, since)
                .await?;
            // `existing` already includes this job itself (still `pending`
            // at read time), unlike bridge.rs's pre-insertion check which
            // uses `>=`. Confirming it doesn't grow the pending+completed
            // count, so only reject if the count is already over cap
            // (e.g. a race let bridge.rs create one job too many).
            if existing as u32 > self.max_daily_per_feed {
                self.store
                    .pending_auto_analysis()
                    .mark_failed(job.id, "per-feed daily auto-analysis cap exceeded")
                    .await?;
                continue;
            }

            if !self
                .store
                .pending_auto_analysis()
                .transition(job.id, &["pending"], "processing")
                .await?
            {
                // Another sweep already claimed this row.
                continue;
            }

            let item_ids = job.item_ids()?;
            let params = AnalysisRunParams {
                model_tag: self.auto_default_model_tag.clone(),
                rate_per_second: self.auto_rate_per_second,
                limit: item_ids.len().max(1) as u32,
                override_existing: false,
                triggered_by: TriggeredBy::Auto,
            };

            match self
                .run_manager
                .preview(RunScope::Items { item_ids }, params)
                .await
            {
                Ok(preview) => match self.run_manager.confirm(preview.run_id).await {
                    Ok(_) => {
                        self.store
                            .pending_auto_analysis()
                            .mark_completed(job.id, preview.run_id)
                            .await?;
                    }
                    Err(RunManagerError::CapacityExceeded) => {
                        warn!(job_id = job.id, "capacity exceeded confirming auto-analysis run, reverting to pending");
                        self.store.pending_auto_analysis().revert_to_pending(job.id).await?;
                    }
                    Err(RunManagerError::Other(e)) => {
                        error!(job_id = job.id, error = %e, "failed to confirm auto-analysis run");
                        self.store.pending_auto_analysis().mark_failed(job.id, &e.to_string()).await?;
                    }
                },
                Err(e) => {
                    error!(job_id = job.id, error = %e, "failed to preview auto-analysis run");
                    self.store
                        .pending_auto_analysis()
                        .mark_failed(job.id, &e.to_string())
                        .await?;
                }
            }
        }

        Ok(())
    }
}
