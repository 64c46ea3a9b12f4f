/*!
common/src/lib.rs

Shared configuration types and DB helper functions for feedpulse.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader for a TOML config file
- Helpers to initialize and migrate an SQLite database
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/feedpulse.db")
    pub path: String,
}

/// Ingestion / scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Global fetch parallelism (concurrent in-flight feed fetches)
    #[serde(default = "default_max_concurrent_feeds")]
    pub max_concurrent_feeds: u32,
    /// How often the scheduler tick fires, in seconds
    #[serde(default = "default_scheduler_tick_seconds")]
    pub scheduler_tick_seconds: u64,
    /// HTTP fetch timeout, in seconds
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    /// Consecutive failures before a feed is marked `error`
    #[serde(default = "default_feed_failure_threshold")]
    pub feed_failure_threshold: u32,
}

fn default_max_concurrent_feeds() -> u32 {
    10
}
fn default_scheduler_tick_seconds() -> u64 {
    60
}
fn default_http_timeout_seconds() -> u64 {
    30
}
fn default_feed_failure_threshold() -> u32 {
    10
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_feeds: default_max_concurrent_feeds(),
            scheduler_tick_seconds: default_scheduler_tick_seconds(),
            http_timeout_seconds: default_http_timeout_seconds(),
            feed_failure_threshold: default_feed_failure_threshold(),
        }
    }
}

/// Analysis run manager / worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: u32,
    #[serde(default = "default_max_daily_runs")]
    pub max_daily_runs: u32,
    #[serde(default = "default_max_daily_auto_runs")]
    pub max_daily_auto_runs: u32,
    #[serde(default = "default_max_hourly_runs")]
    pub max_hourly_runs: u32,
    #[serde(default = "default_rate_per_second")]
    pub analysis_rate_per_second: f64,
    #[serde(default = "default_batch_limit")]
    pub analysis_batch_limit: u32,
    #[serde(default = "default_model_tag")]
    pub default_model_tag: String,
    #[serde(default = "default_llm_timeout_seconds")]
    pub llm_timeout_seconds: u64,
    #[serde(default = "default_processor_tick_seconds")]
    pub processor_tick_seconds: u64,
    #[serde(default = "default_per_run_workers")]
    pub per_run_workers: u32,
    /// Per-model cost table used for run cost estimation (model_tag -> cost_per_item_usd)
    #[serde(default)]
    pub model_costs: HashMap<String, f64>,
}

fn default_max_concurrent_runs() -> u32 {
    6
}
fn default_max_daily_runs() -> u32 {
    300
}
fn default_max_daily_auto_runs() -> u32 {
    1000
}
fn default_max_hourly_runs() -> u32 {
    50
}
fn default_rate_per_second() -> f64 {
    1.5
}
fn default_batch_limit() -> u32 {
    200
}
fn default_model_tag() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_timeout_seconds() -> u64 {
    60
}
fn default_processor_tick_seconds() -> u64 {
    30
}
fn default_per_run_workers() -> u32 {
    4
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: default_max_concurrent_runs(),
            max_daily_runs: default_max_daily_runs(),
            max_daily_auto_runs: default_max_daily_auto_runs(),
            max_hourly_runs: default_max_hourly_runs(),
            analysis_rate_per_second: default_rate_per_second(),
            analysis_batch_limit: default_batch_limit(),
            default_model_tag: default_model_tag(),
            llm_timeout_seconds: default_llm_timeout_seconds(),
            processor_tick_seconds: default_processor_tick_seconds(),
            per_run_workers: default_per_run_workers(),
            model_costs: HashMap::new(),
        }
    }
}

/// Auto-analysis bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoAnalysisConfig {
    #[serde(default = "default_max_items_per_job")]
    pub max_items_per_job: u32,
    #[serde(default = "default_max_daily_per_feed")]
    pub max_daily_per_feed: u32,
}

fn default_max_items_per_job() -> u32 {
    50
}
fn default_max_daily_per_feed() -> u32 {
    10
}

impl Default for AutoAnalysisConfig {
    fn default() -> Self {
        Self {
            max_items_per_job: default_max_items_per_job(),
            max_daily_per_feed: default_max_daily_per_feed(),
        }
    }
}

/// Remote LLM config (OpenAI-compatible HTTP API)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLlmConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_tokens: Option<usize>,
}

/// LLM top-level config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub adapter: Option<String>, // "remote", "none"
    pub remote: Option<RemoteLlmConfig>,
}

/// A single feature flag's configured initial state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlagConfig {
    #[serde(default)]
    pub status: Option<String>, // "off" | "canary" | "on" | "emergency_off"
    #[serde(default)]
    pub rollout_percentage: Option<u8>,
}

/// Admin / maintenance config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    pub auto_migrate: Option<bool>,
    pub diagnostics_dir: Option<String>,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub auto_analysis: AutoAnalysisConfig,
    pub llm: Option<LlmConfig>,
    #[serde(default)]
    pub feature_flags: HashMap<String, FeatureFlagConfig>,
    pub admin: Option<AdminConfig>,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(
        default_path: Option<&Path>,
        override_path: Option<&Path>,
    ) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        if let Some(path) = default_path {
            if path.exists() {
                let data = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read default config: {}", path.display()))?;
                let val: toml::Value =
                    toml::from_str(&data).context("Failed to parse default configuration")?;
                merge_toml(&mut config_value, val);
            }
        }

        if let Some(path) = override_path {
            if path.exists() {
                let data = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read override config: {}", path.display()))?;
                let val: toml::Value =
                    toml::from_str(&data).context("Failed to parse override configuration")?;
                merge_toml(&mut config_value, val);
            }
        }

        let cfg: Config = config_value
            .try_into()
            .context("Failed to parse merged configuration")?;
        Ok(cfg)
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Run SQL migrations using sqlx's migration macro.
/// This expects a `migrations` directory at the workspace root containing SQL
/// migration files. The caller provides an async `SqlitePool` and the migrator
/// is executed against the provided pool.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("../migrations")
        .run(pool)
        .await
        .context("Failed to run sqlx migrations")?;

    Ok(())
}

/// Initialize an SQLite connection pool.
///
/// This function will create the parent directory if necessary, ensure the DB file exists
/// (attempting to create it if missing), and return a configured `SqlitePool`. Defaults are
/// conservative for resource-constrained platforms:
/// - max_connections: 5
/// - WAL journal mode
///
/// Example:
///   let pool = init_db_pool("data/feedpulse.db").await?;
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create DB parent directory: {}", parent.display())
            })?;
        }
    }

    // Try to create the DB file if it does not already exist. This gives a clearer error
    // earlier (filesystem permission or path issues) instead of only surfacing it via the
    // SQLite connection attempt.
    tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to create or open DB file: {}", path))?;

    // Migrations are intended to be executed explicitly by the caller (for example, from `main`)
    // using `run_migrations(pool)` once a `SqlitePool` is available.
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}

/// Convenience: sleep helper used by implementations (kept public for tests)
pub async fn sleep_millis(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::SystemTime;

    #[tokio::test]
    async fn config_from_string_and_db_pool() {
        let toml = r#"
            [database]
            path = "data/test.db"

            [ingestion]
            max_concurrent_feeds = 5

            [analysis]
            analysis_rate_per_second = 2.0
        "#;

        let cfg: Config = toml::from_str(toml).expect("parse config");
        assert_eq!(cfg.ingestion.max_concurrent_feeds, 5);
        assert_eq!(cfg.analysis.analysis_rate_per_second, 2.0);
        // Unset sections fall back to their serde defaults.
        assert_eq!(cfg.auto_analysis.max_daily_per_feed, 10);

        let now = SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time")
            .as_millis();
        let dir = std::env::temp_dir().join(format!("feedpulse_test_{}", now));
        let _ = fs::create_dir_all(&dir);
        let db_path = dir.join("feedpulse.db");
        let db_path_str = db_path.to_string_lossy().to_string();

        let pool = init_db_pool(&db_path_str).await.expect("init pool");
        let conn = pool.acquire().await.expect("acquire conn");
        drop(conn);
    }

    #[tokio::test]
    async fn load_with_defaults_merges_override_over_default() {
        let dir = std::env::temp_dir().join(format!(
            "feedpulse_cfgtest_{}",
            SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        fs::create_dir_all(&dir).unwrap();

        let default_path = dir.join("config.default.toml");
        let override_path = dir.join("config.toml");

        fs::write(
            &default_path,
            r#"
            [database]
            path = "data/default.db"
            [ingestion]
            max_concurrent_feeds = 10
            "#,
        )
        .unwrap();
        fs::write(
            &override_path,
            r#"
            [ingestion]
            max_concurrent_feeds = 25
            "#,
        )
        .unwrap();

        let cfg = Config::load_with_defaults(Some(&default_path), Some(&override_path))
            .await
            .expect("merged config");
        assert_eq!(cfg.database.path, "data/default.db");
        assert_eq!(cfg.ingestion.max_concurrent_feeds, 25);
    }
}
