//! feedpulse - single-binary control plane.
//!
//! Starts the feed scheduler, auto-analysis bridge, pending-analysis
//! processor, and analysis worker pool inside one process, coordinated via
//! a shared shutdown `Notify`. There is no HTTP server in this crate.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use common::{init_db_pool, run_migrations, Config};
use tokio::sync::Notify;
use tokio::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use feedpulse::bridge::AutoAnalysisBridge;
use feedpulse::events::EventBus;
use feedpulse::feature_flags::FeatureFlags;
use feedpulse::fetch::FetchPipeline;
use feedpulse::llm::remote::RemoteLlmProvider;
use feedpulse::llm::LlmProvider;
use feedpulse::model::FlagState;
use feedpulse::pending_processor::PendingAnalysisProcessor;
use feedpulse::run_manager::{AnalysisRunManager, RunManagerConfig};
use feedpulse::scheduler::FeedScheduler;
use feedpulse::store::Store;
use feedpulse::worker_pool::{AnalysisWorkerPool, AnalysisWorkerPoolConfig};

#[derive(Parser, Debug)]
#[command(name = "feedpulse", about = "Feed ingestion and LLM sentiment/impact analysis control plane")]
struct Args {
    /// Path to config.toml (overrides config.default.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run a single scheduler + pending-processor pass, then exit.
    #[arg(long)]
    once: bool,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Disable the feed scheduler.
    #[arg(long)]
    no_scheduler: bool,

    /// Disable the pending-analysis processor.
    #[arg(long)]
    no_pending_processor: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let default_path = PathBuf::from("config.default.toml");
    let override_path = match &args.config {
        Some(p) => {
            if !p.exists() {
                error!(path = ?p, "specified config file not found");
                anyhow::bail!("config file not found: {}", p.display());
            }
            Some(p.clone())
        }
        None => {
            let p = PathBuf::from("config.toml");
            if p.exists() {
                Some(p)
            } else {
                None
            }
        }
    };

    let config = Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        override_path.as_deref(),
    )
    .await
    .context("failed to load configuration")?;
    info!(default = ?default_path, override = ?override_path, "configuration loaded");

    let db_path_abs = tokio::fs::canonicalize(&config.database.path)
        .await
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| config.database.path.clone());
    info!(db_path = %db_path_abs, "resolved DB path");

    let pool = init_db_pool(&db_path_abs)
        .await
        .with_context(|| format!("failed to initialize database pool at {db_path_abs}"))?;
    run_migrations(&pool).await.context("failed to run migrations")?;

    let store = Store::new(pool);
    let events = EventBus::default();
    let shutdown = Arc::new(Notify::new());

    let feature_flags = FeatureFlags::new(events.clone()).with_store(store.clone());
    init_feature_flags(&feature_flags, &store, &config).await?;

    let llm_provider = build_llm_provider(&config)?;

    let fetch_pipeline = Arc::new(
        FetchPipeline::new(
            store.clone(),
            events.clone(),
            Duration::from_secs(config.ingestion.http_timeout_seconds),
        )
        .context("failed to build fetch pipeline (HTTP client)")?,
    );

    let scheduler = Arc::new(FeedScheduler::new(
        store.clone(),
        fetch_pipeline,
        config.ingestion.max_concurrent_feeds,
        config.ingestion.scheduler_tick_seconds,
        config.ingestion.feed_failure_threshold,
    ));

    let bridge = AutoAnalysisBridge::new(
        store.clone(),
        config.auto_analysis.max_items_per_job,
        config.auto_analysis.max_daily_per_feed,
    );

    let run_manager = Arc::new(AnalysisRunManager::new(
        store.clone(),
        events.clone(),
        RunManagerConfig {
            max_concurrent_runs: config.analysis.max_concurrent_runs,
            max_daily_runs: config.analysis.max_daily_runs,
            max_daily_auto_runs: config.analysis.max_daily_auto_runs,
            max_hourly_runs: config.analysis.max_hourly_runs,
            analysis_batch_limit: config.analysis.analysis_batch_limit,
            model_costs: config.analysis.model_costs.clone(),
        },
    ));

    let pending_processor = PendingAnalysisProcessor::new(
        store.clone(),
        run_manager.clone(),
        config.analysis.processor_tick_seconds,
        config.analysis.default_model_tag.clone(),
        config.analysis.analysis_rate_per_second,
        config.auto_analysis.max_daily_per_feed,
    );

    let worker_pool = Arc::new(AnalysisWorkerPool::new(
        store.clone(),
        run_manager.clone(),
        llm_provider,
        AnalysisWorkerPoolConfig {
            per_run_workers: config.analysis.per_run_workers,
            max_concurrent_runs: config.analysis.max_concurrent_runs,
            dispatch_tick: Duration::from_secs(2),
            llm_timeout_seconds: config.analysis.llm_timeout_seconds,
            model_costs: config.analysis.model_costs.clone(),
        },
    ));

    if args.once {
        info!("running a single pass (--once) then exiting");
        if !args.no_scheduler {
            if let Err(e) = scheduler.tick_once().await {
                error!(error = %e, "scheduler pass failed");
            }
        }
        if !args.no_pending_processor {
            if let Err(e) = pending_processor.sweep_once().await {
                error!(error = %e, "pending-analysis sweep failed");
            }
        }
        if let Err(e) = worker_pool.dispatch_once().await {
            error!(error = %e, "worker pool dispatch failed");
        }
        return Ok(());
    }

    let bridge_events = events.clone();
    let bridge_handle = tokio::spawn(async move { bridge.run(bridge_events).await });

    let worker_pool_shutdown = shutdown.clone();
    let worker_pool_for_task = worker_pool.clone();
    let worker_handle =
        tokio::spawn(async move { worker_pool_for_task.run(worker_pool_shutdown).await });

    let scheduler_handle = if !args.no_scheduler {
        let scheduler_shutdown = shutdown.clone();
        let scheduler = scheduler.clone();
        Some(tokio::spawn(async move { scheduler.run(scheduler_shutdown).await }))
    } else {
        info!("feed scheduler disabled via --no-scheduler");
        None
    };

    let pending_processor_handle = if !args.no_pending_processor {
        let pending_shutdown = shutdown.clone();
        Some(tokio::spawn(async move { pending_processor.run(pending_shutdown).await }))
    } else {
        info!("pending-analysis processor disabled via --no-pending-processor");
        None
    };

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("ctrl-c received, signaling shutdown");
    shutdown.notify_waiters();

    let grace_period = Duration::from_secs(20);
    for handle in [scheduler_handle, pending_processor_handle] {
        if let Some(handle) = handle {
            if tokio::time::timeout(grace_period, handle).await.is_err() {
                info!("a component did not exit within the grace period; continuing shutdown");
            }
        }
    }
    let _ = tokio::time::timeout(grace_period, worker_handle).await;
    bridge_handle.abort();

    info!("shutdown complete");
    Ok(())
}

async fn init_feature_flags(
    feature_flags: &FeatureFlags,
    store: &Store,
    config: &Config,
) -> Result<()> {
    for (name, flag_config) in &config.feature_flags {
        let state = flag_config
            .status
            .as_deref()
            .map(parse_flag_state)
            .transpose()?
            .unwrap_or(FlagState::On);
        let rollout = flag_config.rollout_percentage.unwrap_or(100);
        feature_flags.register(name, state, rollout);
    }

    // Persisted checkpoints (rollout changes, emergency trips) override the
    // config-provided initial state so a restart doesn't silently un-trip a
    // flag that was emergency-stopped.
    for row in store.feature_flags().all().await? {
        let state = parse_flag_state(&row.status)?;
        feature_flags.register(&row.name, state, row.rollout_percentage as u8);
    }

    Ok(())
}

fn parse_flag_state(s: &str) -> Result<FlagState> {
    use std::str::FromStr;
    FlagState::from_str(s)
}

fn build_llm_provider(config: &Config) -> Result<Arc<dyn LlmProvider>> {
    let llm_config = config
        .llm
        .as_ref()
        .context("config.llm section is required (adapter = \"remote\")")?;

    match llm_config.adapter.as_deref().unwrap_or("remote") {
        "remote" => {
            let remote = llm_config
                .remote
                .as_ref()
                .context("llm.adapter = \"remote\" requires an [llm.remote] section")?;

            let api_url = remote
                .api_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434/v1/chat/completions".to_string());
            let api_key = match &remote.api_key_env {
                Some(env_var) => std::env::var(env_var)
                    .with_context(|| format!("LLM API key env var '{env_var}' not set"))?,
                None => String::new(),
            };
            let model = remote.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
            let timeout_secs = remote.timeout_seconds.unwrap_or(60);
            let max_tokens = remote.max_tokens.unwrap_or(800);

            let provider = RemoteLlmProvider::new(api_url, api_key, model)
                .with_defaults(timeout_secs, max_tokens, 0.2);
            Ok(Arc::new(provider))
        }
        other => anyhow::bail!("unsupported LLM adapter: {other}"),
    }
}
