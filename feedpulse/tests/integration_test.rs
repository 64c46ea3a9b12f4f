//! End-to-end scenarios seeded from the spec: happy-path auto-analysis,
//! dedup across fetches, capacity caps, and emergency stop. Mirrors the
//! teacher's integration-test shape (spin up a real sqlite pool + schema,
//! drive the components directly) rather than going through a process
//! boundary.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{init_db_pool, run_migrations};
use feedpulse::bridge::AutoAnalysisBridge;
use feedpulse::error::LlmError;
use feedpulse::events::{Event, EventBus};
use feedpulse::fetch::FetchPipeline;
use feedpulse::llm::{LlmProvider, LlmRequest, LlmResponse, UsageMetadata};
use feedpulse::model::{AnalysisResult, AnalysisRunParams, AnalysisRunStatus, RunScope, TriggeredBy};
use feedpulse::pending_processor::PendingAnalysisProcessor;
use feedpulse::run_manager::{AnalysisRunManager, RunManagerConfig};
use feedpulse::scheduler::FeedScheduler;
use feedpulse::store::Store;
use feedpulse::worker_pool::{AnalysisWorkerPool, AnalysisWorkerPoolConfig};

async fn setup_store() -> Store {
    let db_path = std::env::temp_dir().join(format!("feedpulse_test_{}.sqlite", uuid::Uuid::new_v4()));
    let pool = init_db_pool(&db_path.to_string_lossy()).await.expect("init pool");
    run_migrations(&pool).await.expect("run migrations");
    Store::new(pool)
}

fn sample_rss(items: &[(&str, &str)]) -> String {
    let entries: String = items
        .iter()
        .map(|(guid, title)| {
            format!(
                r#"<item>
                    <title>{title}</title>
                    <link>https://example.com/{guid}</link>
                    <guid>{guid}</guid>
                    <description>Summary for {title}</description>
                    <pubDate>Mon, 01 Jan 2024 00:00:00 GMT</pubDate>
                </item>"#
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
        <rss version="2.0"><channel><title>Test Feed</title>{entries}</channel></rss>"#
    )
}

/// Canned LLM provider used by worker-pool scenarios so tests never make a
/// real network call.
struct FakeLlmProvider {
    latency: Duration,
}

#[async_trait::async_trait]
impl LlmProvider for FakeLlmProvider {
    async fn generate(&self, _request: LlmRequest) -> Result<LlmResponse, LlmError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let result = AnalysisResult::neutral_fallback();
        let content = serde_json::to_string(&result).unwrap();
        Ok(LlmResponse {
            content,
            usage: UsageMetadata {
                prompt_tokens: 10,
                completion_tokens: 20,
                total_tokens: 30,
            },
            model: "fake-model".to_string(),
        })
    }
}

fn model_costs() -> HashMap<String, f64> {
    let mut m = HashMap::new();
    m.insert("test-model".to_string(), 0.001);
    m
}

fn run_manager_config(max_concurrent_runs: u32) -> RunManagerConfig {
    RunManagerConfig {
        max_concurrent_runs,
        max_daily_runs: 300,
        max_daily_auto_runs: 1000,
        max_hourly_runs: 50,
        analysis_batch_limit: 200,
        model_costs: model_costs(),
    }
}

async fn drain_worker_pool(pool: &AnalysisWorkerPool, max_ticks: u32) {
    for _ in 0..max_ticks {
        pool.dispatch_once().await.expect("dispatch tick");
    }
}

#[tokio::test]
async fn s1_happy_path_auto_analysis() {
    let mut server = mockito::Server::new_async().await;
    let body = sample_rss(&[("a1", "First"), ("a2", "Second"), ("a3", "Third")]);
    let mock = server
        .mock("GET", "/feed.xml")
        .with_status(200)
        .with_body(body)
        .create_async()
        .await;

    let store = setup_store().await;
    let events = EventBus::default();

    let feed_id = store
        .feeds()
        .create(&format!("{}/feed.xml", server.url()), Some("Test"), 15, true)
        .await
        .expect("create feed");

    let pipeline = FetchPipeline::new(store.clone(), events.clone(), Duration::from_secs(5))
        .expect("build pipeline");

    let mut receiver = events.subscribe();
    let feed = store.feeds().get(feed_id).await.unwrap();
    pipeline.run_once(&feed).await.expect("fetch ok");
    mock.assert_async().await;

    let items = store.items().by_feed(feed_id).await.unwrap();
    assert_eq!(items.len(), 3);

    let logs = store.fetch_logs().recent_for_feed(feed_id, 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].items_new, 3);
    assert_eq!(logs[0].items_found, 3);

    let fetched_event = tokio::time::timeout(Duration::from_secs(1), receiver.recv())
        .await
        .expect("event within timeout")
        .expect("event received");
    let Event::FeedFetched(payload) = fetched_event else {
        panic!("expected FeedFetched event");
    };
    assert_eq!(payload.new_item_ids.len(), 3);

    let bridge = AutoAnalysisBridge::new(store.clone(), 50, 10);
    bridge.handle(payload).await.expect("bridge handles event");

    let pending = store.pending_auto_analysis().pending_ordered().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].item_ids().unwrap().len(), 3);

    let run_manager = Arc::new(AnalysisRunManager::new(
        store.clone(),
        events.clone(),
        run_manager_config(6),
    ));
    let processor = PendingAnalysisProcessor::new(
        store.clone(),
        run_manager.clone(),
        30,
        "test-model".to_string(),
        10.0,
        10,
    );
    processor.sweep_once().await.expect("sweep ok");

    let pending_after = store.pending_auto_analysis().pending_ordered().await.unwrap();
    assert!(pending_after.is_empty());

    let runs = store.analysis_runs().running_runs().await.unwrap();
    assert_eq!(runs.len(), 1);
    let run_id = runs[0].id;
    assert_eq!(runs[0].triggered_by(), TriggeredBy::Auto);

    let worker_pool = AnalysisWorkerPool::new(
        store.clone(),
        run_manager.clone(),
        Arc::new(FakeLlmProvider { latency: Duration::ZERO }),
        AnalysisWorkerPoolConfig {
            per_run_workers: 4,
            max_concurrent_runs: 6,
            dispatch_tick: Duration::from_millis(10),
            llm_timeout_seconds: 5,
            model_costs: model_costs(),
        },
    );
    drain_worker_pool(&worker_pool, 5).await;

    let run = store.analysis_runs().get(run_id).await.unwrap();
    assert_eq!(run.status(), AnalysisRunStatus::Completed);
    assert_eq!(run.processed_count, 3);
    assert_eq!(run.failed_count, 0);

    for item in &items {
        store.item_analysis().get(item.id).await.expect("analysis written");
    }
}

#[tokio::test]
async fn s2_dedup_across_fetches() {
    let mut server = mockito::Server::new_async().await;
    let body = sample_rss(&[("a1", "First"), ("a2", "Second"), ("a3", "Third")]);
    server
        .mock("GET", "/feed.xml")
        .with_status(200)
        .with_body(body.clone())
        .expect(2)
        .create_async()
        .await;

    let store = setup_store().await;
    let events = EventBus::default();
    let feed_id = store
        .feeds()
        .create(&format!("{}/feed.xml", server.url()), Some("Test"), 15, true)
        .await
        .expect("create feed");
    let pipeline = FetchPipeline::new(store.clone(), events.clone(), Duration::from_secs(5))
        .expect("build pipeline");

    let feed = store.feeds().get(feed_id).await.unwrap();
    pipeline.run_once(&feed).await.expect("first fetch ok");
    pipeline.run_once(&feed).await.expect("second fetch ok");

    let items = store.items().by_feed(feed_id).await.unwrap();
    assert_eq!(items.len(), 3, "no duplicate items inserted");

    let logs = store.fetch_logs().recent_for_feed(feed_id, 10).await.unwrap();
    assert_eq!(logs.len(), 2);
    let second = logs.iter().min_by_key(|l| l.id).unwrap();
    assert_eq!(second.items_new, 0);
    assert_eq!(second.items_found, 3);
}

#[tokio::test]
async fn s3_rate_limiting_bounds_wall_clock() {
    let store = setup_store().await;
    let events = EventBus::default();
    let feed_id = store
        .feeds()
        .create("https://example.com/rate.xml", Some("Rate"), 15, false)
        .await
        .unwrap();

    let mut item_ids = Vec::new();
    for i in 0..10 {
        let new_item = feedpulse::model::NewItem {
            feed_id,
            title: Some(format!("Item {i}")),
            link: Some(format!("https://example.com/rate/{i}")),
            description: None,
            content: None,
            author: None,
            published_at: None,
            guid: Some(format!("rate-{i}")),
            content_hash: format!("rate-hash-{i}"),
        };
        let (_, id) = store.items().upsert_by_content_hash(&new_item).await.unwrap();
        item_ids.push(id);
    }

    let run_manager = Arc::new(AnalysisRunManager::new(store.clone(), events.clone(), run_manager_config(6)));
    let preview = run_manager
        .preview(
            RunScope::Items { item_ids },
            AnalysisRunParams {
                model_tag: "test-model".to_string(),
                rate_per_second: 2.0,
                limit: 200,
                override_existing: false,
                triggered_by: TriggeredBy::Manual,
            },
        )
        .await
        .expect("preview ok");
    assert_eq!(preview.item_count, 10);
    run_manager.confirm(preview.run_id).await.expect("confirm ok");

    let worker_pool = AnalysisWorkerPool::new(
        store.clone(),
        run_manager.clone(),
        Arc::new(FakeLlmProvider { latency: Duration::from_millis(50) }),
        AnalysisWorkerPoolConfig {
            per_run_workers: 4,
            max_concurrent_runs: 6,
            dispatch_tick: Duration::from_millis(20),
            llm_timeout_seconds: 5,
            model_costs: model_costs(),
        },
    );

    let start = tokio::time::Instant::now();
    loop {
        worker_pool.dispatch_once().await.expect("dispatch ok");
        let run = store.analysis_runs().get(preview.run_id).await.unwrap();
        if run.status().is_terminal() {
            break;
        }
        if start.elapsed() > Duration::from_secs(15) {
            panic!("run did not complete in time");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let elapsed = start.elapsed();

    // rate_per_second=2.0, 10 items => wall time >= 10/2 = 5s, with slack.
    assert!(elapsed >= Duration::from_millis(4500), "elapsed too short: {elapsed:?}");

    let run = store.analysis_runs().get(preview.run_id).await.unwrap();
    assert_eq!(run.status(), AnalysisRunStatus::Completed);
    assert_eq!(run.processed_count, 10);
}

#[tokio::test]
async fn s4_capacity_cap_queues_excess_runs() {
    let store = setup_store().await;
    let events = EventBus::default();
    let feed_id = store
        .feeds()
        .create("https://example.com/cap.xml", Some("Cap"), 15, false)
        .await
        .unwrap();

    let mut make_run = |tag: &str| {
        let store = store.clone();
        let tag = tag.to_string();
        async move {
            let new_item = feedpulse::model::NewItem {
                feed_id,
                title: Some(format!("Item {tag}")),
                link: Some(format!("https://example.com/cap/{tag}")),
                description: None,
                content: None,
                author: None,
                published_at: None,
                guid: Some(format!("cap-{tag}")),
                content_hash: format!("cap-hash-{tag}"),
            };
            let (_, id) = store.items().upsert_by_content_hash(&new_item).await.unwrap();
            id
        }
    };

    let run_manager = Arc::new(AnalysisRunManager::new(store.clone(), events.clone(), run_manager_config(2)));

    let mut run_ids = Vec::new();
    for i in 0..3 {
        let item_id = make_run(&i.to_string()).await;
        let preview = run_manager
            .preview(
                RunScope::Items { item_ids: vec![item_id] },
                AnalysisRunParams {
                    model_tag: "test-model".to_string(),
                    rate_per_second: 5.0,
                    limit: 10,
                    override_existing: false,
                    triggered_by: TriggeredBy::Manual,
                },
            )
            .await
            .unwrap();
        run_manager.confirm(preview.run_id).await.unwrap();
        run_ids.push(preview.run_id);
    }

    let statuses: Vec<AnalysisRunStatus> = {
        let mut out = Vec::new();
        for id in &run_ids {
            out.push(store.analysis_runs().get(*id).await.unwrap().status());
        }
        out
    };
    let running_count = statuses.iter().filter(|s| **s == AnalysisRunStatus::Running).count();
    let queued_count = statuses.iter().filter(|s| **s == AnalysisRunStatus::Queued).count();
    assert_eq!(running_count, 2, "exactly max_concurrent_runs should be running");
    assert_eq!(queued_count, 1, "the third run should stay queued");

    // Finalize the first running run; the queued one should then be promoted.
    let first_running_id = run_ids
        .iter()
        .zip(statuses.iter())
        .find(|(_, s)| **s == AnalysisRunStatus::Running)
        .map(|(id, _)| *id)
        .unwrap();
    store
        .analysis_run_items()
        .claim_queued(first_running_id, 10)
        .await
        .unwrap();
    store
        .analysis_run_items()
        .transition(first_running_id, {
            store.analysis_run_items().all_for_run(first_running_id).await.unwrap()[0].item_id
        }, &["processing"], "completed", Some(1), Some(0.001), None)
        .await
        .unwrap();
    run_manager.finalize_if_complete(first_running_id).await.unwrap();

    let third_status = store.analysis_runs().get(run_ids[2]).await.unwrap().status();
    assert_eq!(third_status, AnalysisRunStatus::Running, "queued run promoted after a slot freed");
}

#[tokio::test]
async fn s5_emergency_stop_pauses_and_resume_all_restores() {
    let store = setup_store().await;
    let events = EventBus::default();
    let feed_id = store
        .feeds()
        .create("https://example.com/stop.xml", Some("Stop"), 15, false)
        .await
        .unwrap();

    let run_manager = Arc::new(AnalysisRunManager::new(store.clone(), events.clone(), run_manager_config(6)));

    let mut run_ids = Vec::new();
    for i in 0..2 {
        let new_item = feedpulse::model::NewItem {
            feed_id,
            title: Some(format!("Stop item {i}")),
            link: Some(format!("https://example.com/stop/{i}")),
            description: None,
            content: None,
            author: None,
            published_at: None,
            guid: Some(format!("stop-{i}")),
            content_hash: format!("stop-hash-{i}"),
        };
        let (_, item_id) = store.items().upsert_by_content_hash(&new_item).await.unwrap();
        let preview = run_manager
            .preview(
                RunScope::Items { item_ids: vec![item_id] },
                AnalysisRunParams {
                    model_tag: "test-model".to_string(),
                    rate_per_second: 5.0,
                    limit: 10,
                    override_existing: false,
                    triggered_by: TriggeredBy::Manual,
                },
            )
            .await
            .unwrap();
        run_manager.confirm(preview.run_id).await.unwrap();
        run_ids.push(preview.run_id);
    }

    for id in &run_ids {
        assert_eq!(store.analysis_runs().get(*id).await.unwrap().status(), AnalysisRunStatus::Running);
    }

    run_manager.emergency_stop().await.expect("emergency stop ok");
    for id in &run_ids {
        assert_eq!(store.analysis_runs().get(*id).await.unwrap().status(), AnalysisRunStatus::Paused);
    }

    // New confirmations are refused while emergency-stopped.
    let new_item = feedpulse::model::NewItem {
        feed_id,
        title: Some("During stop".to_string()),
        link: Some("https://example.com/stop/during".to_string()),
        description: None,
        content: None,
        author: None,
        published_at: None,
        guid: Some("stop-during".to_string()),
        content_hash: "stop-hash-during".to_string(),
    };
    let (_, item_id) = store.items().upsert_by_content_hash(&new_item).await.unwrap();
    let preview = run_manager
        .preview(
            RunScope::Items { item_ids: vec![item_id] },
            AnalysisRunParams {
                model_tag: "test-model".to_string(),
                rate_per_second: 5.0,
                limit: 10,
                override_existing: false,
                triggered_by: TriggeredBy::Manual,
            },
        )
        .await
        .unwrap();
    run_manager.confirm(preview.run_id).await.unwrap();
    assert_eq!(
        store.analysis_runs().get(preview.run_id).await.unwrap().status(),
        AnalysisRunStatus::Queued,
        "confirmations during emergency stop stay queued, not running"
    );

    run_manager.resume_all().await.expect("resume all ok");
    for id in &run_ids {
        assert_eq!(store.analysis_runs().get(*id).await.unwrap().status(), AnalysisRunStatus::Running);
    }
    assert_eq!(
        store.analysis_runs().get(preview.run_id).await.unwrap().status(),
        AnalysisRunStatus::Running,
        "the previously queued run is promoted once capacity is available again"
    );
}

#[tokio::test]
async fn s6_fetch_failure_backoff_grows_and_caps() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("GET", "/flaky.xml")
        .with_status(500)
        .expect_at_least(3)
        .create_async()
        .await;

    let store = setup_store().await;
    let events = EventBus::default();
    let feed_id = store
        .feeds()
        .create(&format!("{}/flaky.xml", server.url()), Some("Flaky"), 15, false)
        .await
        .unwrap();

    let pipeline = Arc::new(
        FetchPipeline::new(store.clone(), events.clone(), Duration::from_secs(5)).expect("build pipeline"),
    );
    let scheduler = FeedScheduler::new(store.clone(), pipeline, 5, 60, 10);

    // Each iteration simulates enough wall-clock time having passed for the
    // feed to become due again, since the real next_fetch_at spacing (tens of
    // minutes) can't be waited out in a test.
    let mut spacing_minutes = Vec::new();
    for _ in 0..3 {
        store
            .feeds()
            .set_next_fetch_at(feed_id, chrono::Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        let before = chrono::Utc::now();
        scheduler.tick_once().await.expect("tick ok");
        let feed = store.feeds().get(feed_id).await.unwrap();
        let next = feed.next_fetch_at.expect("next_fetch_at set after failed fetch");
        spacing_minutes.push((next - before).num_minutes());
    }

    let logs = store.fetch_logs().recent_for_feed(feed_id, 10).await.unwrap();
    assert_eq!(logs.len(), 3, "three fetch attempts, three FetchLog rows");
    assert!(logs.iter().all(|l| l.status == "failure"));

    let health = store.feed_health().get(feed_id).await.unwrap();
    assert_eq!(health.consecutive_failures, 3);

    // backoff = min(interval * 2^(failures-1), 6h): 15, 30, 60 minutes for
    // the 1st/2nd/3rd consecutive failure against a 15-minute interval.
    assert!(
        (14..=16).contains(&spacing_minutes[0]),
        "expected ~1x interval after first failure, got {:?}",
        spacing_minutes[0]
    );
    assert!(
        (29..=31).contains(&spacing_minutes[1]),
        "expected ~2x interval after second failure, got {:?}",
        spacing_minutes[1]
    );
    assert!(
        (59..=61).contains(&spacing_minutes[2]),
        "expected ~4x interval after third failure, got {:?}",
        spacing_minutes[2]
    );
}
