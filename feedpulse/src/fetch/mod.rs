//! FetchPipeline: one fetch attempt for one feed — HTTP fetch, parse,
//! normalize, dedupe by content hash, persist, and emit `FeedFetched`.
//!
//! Grounded on the teacher's `ingestion.rs` (reqwest client + retry/backoff
//! loop) and `storage.rs` (per-item dedup + occurrence bookkeeping), with
//! failure classification generalized from the FluxFeed scheduler's
//! retryable/non-retryable HTTP split.

pub mod content_hash;

use std::time::Duration;

use chrono::Utc;
use feed_rs::model::Feed as ParsedFeed;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use crate::events::{Event, EventBus};
use crate::model::{Feed, FetchLogStatus, NewItem, UpsertOutcome};
use crate::store::Store;

pub struct FetchPipeline {
    client: Client,
    store: Store,
    events: EventBus,
    http_timeout: Duration,
}

enum FetchOutcome {
    Parsed(ParsedFeed),
    Retryable(anyhow::Error),
    Fatal(anyhow::Error),
}

impl FetchPipeline {
    pub fn new(store: Store, events: EventBus, http_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(http_timeout)
            .user_agent("feedpulse/0.1")
            .build()?;
        Ok(Self {
            client,
            store,
            events,
            http_timeout,
        })
    }

    /// Run one fetch attempt for `feed`. Never returns an error for
    /// ordinary fetch failures — those are recorded in the FetchLog row and
    /// reflected in FeedHealth, per spec §4.3 ("scheduler itself never
    /// fails runs — only dispatches").
    pub async fn run_once(&self, feed: &Feed) -> anyhow::Result<()> {
        let started_at = Utc::now();
        let log_id = self.store.fetch_logs().start(feed.id, started_at).await?;

        let fetch_started = std::time::Instant::now();
        let outcome = self.fetch_and_parse(&feed.url).await;
        let response_time_ms = fetch_started.elapsed().as_millis() as i64;

        match outcome {
            FetchOutcome::Parsed(parsed) => match self.persist_entries(feed.id, &parsed).await {
                Ok((items_found, items_new, items_dropped, new_item_ids)) => {
                    self.store
                        .fetch_logs()
                        .complete(
                            log_id,
                            FetchLogStatus::Success,
                            items_found,
                            items_new,
                            items_dropped,
                            None,
                            response_time_ms,
                        )
                        .await?;

                    self.update_health(feed.id, true, response_time_ms).await?;

                    info!(feed_id = feed.id, items_found, items_new, "fetch succeeded");

                    if !new_item_ids.is_empty() {
                        self.events.publish(Event::FeedFetched(crate::model::FeedFetched {
                            feed_id: feed.id,
                            new_item_ids,
                            fetched_at: Utc::now(),
                        }));
                    }
                }
                Err(err) => {
                    // Store errors survive persist_entries' own in-fetch retry
                    // (spec §4.4: 3 attempts, 100ms/500ms/2s) only as fatal;
                    // the fetch still completes its FetchLog row and health
                    // update rather than leaving the attempt unaccounted for.
                    warn!(feed_id = feed.id, error = %err, "fetch failed (store error persisting items)");
                    self.store
                        .fetch_logs()
                        .complete(
                            log_id,
                            FetchLogStatus::Failure,
                            0,
                            0,
                            0,
                            Some(&err.to_string()),
                            response_time_ms,
                        )
                        .await?;
                    self.update_health(feed.id, false, response_time_ms).await?;
                }
            },
            FetchOutcome::Retryable(err) => {
                warn!(feed_id = feed.id, error = %err, "fetch failed (retryable class)");
                self.store
                    .fetch_logs()
                    .complete(
                        log_id,
                        FetchLogStatus::Failure,
                        0,
                        0,
                        0,
                        Some(&err.to_string()),
                        response_time_ms,
                    )
                    .await?;
                self.update_health(feed.id, false, response_time_ms).await?;
            }
            FetchOutcome::Fatal(err) => {
                warn!(feed_id = feed.id, error = %err, "fetch failed (non-retryable, e.g. 4xx)");
                self.store
                    .fetch_logs()
                    .complete(
                        log_id,
                        FetchLogStatus::Failure,
                        0,
                        0,
                        0,
                        Some(&err.to_string()),
                        response_time_ms,
                    )
                    .await?;
                // Non-retryable client errors do not reset consecutive_failures,
                // but they are not a fresh failure streak contributor either in
                // the sense of triggering backoff growth beyond the HTTP status;
                // treat as a failed attempt for health bookkeeping (spec §4.4).
                self.update_health(feed.id, false, response_time_ms).await?;
            }
        }

        Ok(())
    }

    async fn fetch_and_parse(&self, url: &str) -> FetchOutcome {
        let max_retries = 3;
        let mut last_error = None;

        for attempt in 1..=max_retries {
            if attempt > 1 {
                let backoff = Duration::from_millis(match attempt {
                    2 => 100,
                    3 => 500,
                    _ => 2000,
                });
                debug!(url, attempt, ?backoff, "retrying feed fetch");
                tokio::time::sleep(backoff).await;
            }

            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let bytes = match response.bytes().await {
                            Ok(b) => b,
                            Err(e) => {
                                last_error = Some(anyhow::Error::new(e).context("reading response body"));
                                continue;
                            }
                        };
                        return match feed_rs::parser::parse(bytes.as_ref()) {
                            Ok(parsed) => FetchOutcome::Parsed(parsed),
                            Err(e) => FetchOutcome::Fatal(
                                anyhow::Error::new(e).context("parse error (partial results, if any, are not recoverable from a non-streaming parser)"),
                            ),
                        };
                    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                        last_error = Some(anyhow::anyhow!("retryable HTTP status: {status}"));
                        continue;
                    } else {
                        return FetchOutcome::Fatal(anyhow::anyhow!(
                            "non-retryable HTTP status: {status}"
                        ));
                    }
                }
                Err(e) => {
                    last_error = Some(anyhow::Error::new(e).context("network error"));
                }
            }
        }

        FetchOutcome::Retryable(
            last_error.unwrap_or_else(|| anyhow::anyhow!("unknown error after retries")),
        )
    }

    /// Returns (items_found, items_new, items_dropped, new_item_ids).
    async fn persist_entries(
        &self,
        feed_id: i64,
        parsed: &ParsedFeed,
    ) -> anyhow::Result<(i64, i64, i64, Vec<i64>)> {
        let mut items_found = 0i64;
        let mut items_new = 0i64;
        let mut items_dropped = 0i64;
        let mut new_item_ids = Vec::new();

        for entry in &parsed.entries {
            let title = entry.title.as_ref().map(|t| t.content.clone());
            let link = entry.links.first().map(|l| l.href.clone());

            if title.is_none() && link.is_none() {
                items_dropped += 1;
                continue;
            }

            let description = entry.summary.as_ref().map(|s| s.content.clone());
            let content = entry
                .content
                .as_ref()
                .and_then(|c| c.body.clone())
                .or_else(|| description.clone());
            let author = entry.authors.first().map(|a| a.name.clone());
            let published_at = entry.published.or(entry.updated);
            let guid = Some(entry.id.clone()).filter(|s| !s.is_empty());

            let hash = content_hash::content_hash(
                feed_id,
                guid.as_deref(),
                link.as_deref(),
                title.as_deref(),
                published_at,
            );

            let new_item = NewItem {
                feed_id,
                title,
                link,
                description,
                content,
                author,
                published_at,
                guid,
                content_hash: hash,
            };

            items_found += 1;
            let (outcome, id) = self.upsert_with_retry(&new_item).await?;
            if outcome == UpsertOutcome::Inserted {
                items_new += 1;
                new_item_ids.push(id);
            }
        }

        Ok((items_found, items_new, items_dropped, new_item_ids))
    }

    /// Retry a transient store error up to 3 times within the fetch, with
    /// the configured backoff (100ms, 500ms, 2s), before failing the whole
    /// fetch attempt (spec §4.4, §7).
    async fn upsert_with_retry(
        &self,
        new_item: &NewItem,
    ) -> anyhow::Result<(UpsertOutcome, i64)> {
        const RETRY_BACKOFF_MS: [u64; 3] = [100, 500, 2000];
        let mut attempt = 0usize;
        loop {
            match self.store.items().upsert_by_content_hash(new_item).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt < RETRY_BACKOFF_MS.len() => {
                    warn!(attempt, error = %e, "transient store error persisting item, retrying");
                    tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS[attempt])).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn update_health(&self, feed_id: i64, success: bool, response_time_ms: i64) -> anyhow::Result<()> {
        let now = Utc::now();
        let uptime_24h = self
            .store
            .fetch_logs()
            .uptime_since(feed_id, now - chrono::Duration::hours(24))
            .await?;
        let uptime_7d = self
            .store
            .fetch_logs()
            .uptime_since(feed_id, now - chrono::Duration::days(7))
            .await?;

        self.store
            .feed_health()
            .record_attempt(feed_id, success, response_time_ms, uptime_24h, uptime_7d)
            .await?;

        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        self.http_timeout
    }
}
