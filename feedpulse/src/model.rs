//! Entity types shared across the store, scheduler, bridge, run manager and
//! worker pool. Enums round-trip to TEXT columns, matching the teacher's
//! habit of storing status fields as readable strings rather than integers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------
// Feed
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedStatus {
    Active,
    Inactive,
    Error,
}

impl fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FeedStatus::Active => "active",
            FeedStatus::Inactive => "inactive",
            FeedStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl FromStr for FeedStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(FeedStatus::Active),
            "inactive" => Ok(FeedStatus::Inactive),
            "error" => Ok(FeedStatus::Error),
            other => anyhow::bail!("unknown feed status: {other}"),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Feed {
    pub id: i64,
    pub url: String,
    pub title: Option<String>,
    pub status: String,
    pub fetch_interval_minutes: i64,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub next_fetch_at: Option<DateTime<Utc>>,
    pub auto_analyze_enabled: bool,
    pub source: Option<String>,
    pub feed_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Feed {
    pub fn status(&self) -> FeedStatus {
        FeedStatus::from_str(&self.status).unwrap_or(FeedStatus::Error)
    }
}

// ---------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Item {
    pub id: i64,
    pub feed_id: i64,
    pub title: Option<String>,
    pub link: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub guid: Option<String>,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

/// A parsed feed entry not yet persisted; the caller (FetchPipeline)
/// computes `content_hash` before handing this to the store.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub feed_id: i64,
    pub title: Option<String>,
    pub link: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub guid: Option<String>,
    pub content_hash: String,
}

/// Result of an upsert-by-content-hash: whether the row was newly inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Existing,
}

// ---------------------------------------------------------------------
// FetchLog
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchLogStatus {
    Pending,
    Success,
    Partial,
    Failure,
}

impl fmt::Display for FetchLogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FetchLogStatus::Pending => "pending",
            FetchLogStatus::Success => "success",
            FetchLogStatus::Partial => "partial",
            FetchLogStatus::Failure => "failure",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FetchLog {
    pub id: i64,
    pub feed_id: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: String,
    pub items_found: i64,
    pub items_new: i64,
    pub items_dropped: i64,
    pub error_message: Option<String>,
    pub response_time_ms: Option<i64>,
}

// ---------------------------------------------------------------------
// FeedHealth
// ---------------------------------------------------------------------

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FeedHealth {
    pub feed_id: i64,
    pub ok_ratio: f64,
    pub consecutive_failures: i64,
    pub avg_response_time_ms: f64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub uptime_24h: f64,
    pub uptime_7d: f64,
}

/// Rolling window length used for the `ok_ratio` EWMA (spec default N=50,
/// kept tunable here rather than hardcoded inline).
pub const FEED_HEALTH_EWMA_WINDOW: f64 = 50.0;

// ---------------------------------------------------------------------
// AnalysisRun
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisRunStatus {
    Pending,
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl AnalysisRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AnalysisRunStatus::Completed | AnalysisRunStatus::Failed | AnalysisRunStatus::Cancelled
        )
    }
}

impl fmt::Display for AnalysisRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnalysisRunStatus::Pending => "pending",
            AnalysisRunStatus::Queued => "queued",
            AnalysisRunStatus::Running => "running",
            AnalysisRunStatus::Paused => "paused",
            AnalysisRunStatus::Completed => "completed",
            AnalysisRunStatus::Failed => "failed",
            AnalysisRunStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl FromStr for AnalysisRunStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => AnalysisRunStatus::Pending,
            "queued" => AnalysisRunStatus::Queued,
            "running" => AnalysisRunStatus::Running,
            "paused" => AnalysisRunStatus::Paused,
            "completed" => AnalysisRunStatus::Completed,
            "failed" => AnalysisRunStatus::Failed,
            "cancelled" => AnalysisRunStatus::Cancelled,
            other => anyhow::bail!("unknown analysis run status: {other}"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggeredBy {
    Manual,
    Auto,
    Scheduled,
}

impl fmt::Display for TriggeredBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggeredBy::Manual => "manual",
            TriggeredBy::Auto => "auto",
            TriggeredBy::Scheduled => "scheduled",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TriggeredBy {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "manual" => TriggeredBy::Manual,
            "auto" => TriggeredBy::Auto,
            "scheduled" => TriggeredBy::Scheduled,
            other => anyhow::bail!("unknown triggered_by: {other}"),
        })
    }
}

/// Tagged variant for an analysis run's scope, resolved to a concrete item
/// list at preview time and never re-resolved at execute time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunScope {
    Global,
    Feeds { feed_ids: Vec<i64> },
    Items { item_ids: Vec<i64> },
    TimeRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

#[derive(Debug, Clone)]
pub struct AnalysisRunParams {
    pub model_tag: String,
    pub rate_per_second: f64,
    pub limit: u32,
    pub override_existing: bool,
    pub triggered_by: TriggeredBy,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AnalysisRun {
    pub id: i64,
    pub status: String,
    pub scope_json: String,
    pub model_tag: String,
    pub rate_per_second: f64,
    pub item_limit: i64,
    pub override_existing: bool,
    pub triggered_by: String,
    pub queued_count: i64,
    pub processed_count: i64,
    pub failed_count: i64,
    pub cost_estimate_usd: f64,
    pub actual_cost_usd: f64,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl AnalysisRun {
    pub fn status(&self) -> AnalysisRunStatus {
        AnalysisRunStatus::from_str(&self.status).unwrap_or(AnalysisRunStatus::Failed)
    }

    pub fn triggered_by(&self) -> TriggeredBy {
        TriggeredBy::from_str(&self.triggered_by).unwrap_or(TriggeredBy::Manual)
    }

    pub fn scope(&self) -> anyhow::Result<RunScope> {
        Ok(serde_json::from_str(&self.scope_json)?)
    }
}

/// Result of a successful preview, returned to the caller of `preview()`.
#[derive(Debug, Clone, Serialize)]
pub struct RunPreview {
    pub run_id: i64,
    pub item_count: u32,
    pub already_analyzed_count: u32,
    pub new_items_count: u32,
    pub estimated_cost_usd: f64,
    pub estimated_duration_seconds: f64,
}

// ---------------------------------------------------------------------
// AnalysisRunItem
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisRunItemState {
    Queued,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl fmt::Display for AnalysisRunItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AnalysisRunItemState::Queued => "queued",
            AnalysisRunItemState::Processing => "processing",
            AnalysisRunItemState::Completed => "completed",
            AnalysisRunItemState::Failed => "failed",
            AnalysisRunItemState::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl FromStr for AnalysisRunItemState {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => AnalysisRunItemState::Queued,
            "processing" => AnalysisRunItemState::Processing,
            "completed" => AnalysisRunItemState::Completed,
            "failed" => AnalysisRunItemState::Failed,
            "skipped" => AnalysisRunItemState::Skipped,
            other => anyhow::bail!("unknown run item state: {other}"),
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AnalysisRunItem {
    pub run_id: i64,
    pub item_id: i64,
    pub state: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tokens_used: i64,
    pub cost_usd: f64,
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------
// ItemAnalysis + the analysis result JSON schema
// ---------------------------------------------------------------------

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ItemAnalysisRow {
    pub item_id: i64,
    pub sentiment_json: String,
    pub impact_json: String,
    pub model_tag: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeHorizon {
    Short,
    Medium,
    Long,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeoTimeHorizon {
    ShortTerm,
    MediumTerm,
    LongTerm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    Diplomatic,
    Economic,
    Military,
    Hybrid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverallSentiment {
    pub label: SentimentLabel,
    pub score: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSentiment {
    pub bullish: f64,
    pub bearish: f64,
    pub uncertainty: f64,
    pub time_horizon: TimeHorizon,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiplomaticImpact {
    pub global: f64,
    pub western: f64,
    pub regional: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeopoliticalAnalysis {
    pub stability_score: f64,
    pub economic_impact: f64,
    pub security_relevance: f64,
    pub diplomatic_impact: DiplomaticImpact,
    pub escalation_potential: f64,
    pub regions_affected: Vec<String>,
    pub impact_beneficiaries: Vec<String>,
    pub impact_affected: Vec<String>,
    pub time_horizon: GeoTimeHorizon,
    pub confidence: f64,
    pub alliance_activation: Vec<String>,
    pub conflict_type: ConflictType,
}

impl GeopoliticalAnalysis {
    /// Zero/empty subtree used for non-geopolitical items (spec §6: "all
    /// fields required; non-geopolitical items set the geopolitical subtree
    /// to zero/empty with confidence=0").
    pub fn neutral() -> Self {
        Self {
            stability_score: 0.0,
            economic_impact: 0.0,
            security_relevance: 0.0,
            diplomatic_impact: DiplomaticImpact {
                global: 0.0,
                western: 0.0,
                regional: 0.0,
            },
            escalation_potential: 0.0,
            regions_affected: Vec::new(),
            impact_beneficiaries: Vec::new(),
            impact_affected: Vec::new(),
            time_horizon: GeoTimeHorizon::ShortTerm,
            confidence: 0.0,
            alliance_activation: Vec::new(),
            conflict_type: ConflictType::Diplomatic,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sentiment {
    pub overall: OverallSentiment,
    pub market: MarketSentiment,
    pub urgency: f64,
    pub themes: Vec<String>,
    pub geopolitical: GeopoliticalAnalysis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Impact {
    pub overall: f64,
    pub volatility: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub sentiment: Sentiment,
    pub impact: Impact,
}

impl AnalysisResult {
    /// Fallback analysis written when a worker exhausts retries on an item
    /// (spec §4.8 step 5, §7 "every item has ... a fallback with neutral
    /// scores").
    pub fn neutral_fallback() -> Self {
        Self {
            sentiment: Sentiment {
                overall: OverallSentiment {
                    label: SentimentLabel::Neutral,
                    score: 0.0,
                    confidence: 0.0,
                },
                market: MarketSentiment {
                    bullish: 0.0,
                    bearish: 0.0,
                    uncertainty: 1.0,
                    time_horizon: TimeHorizon::Short,
                },
                urgency: 0.0,
                themes: Vec::new(),
                geopolitical: GeopoliticalAnalysis::neutral(),
            },
            impact: Impact {
                overall: 0.0,
                volatility: 0.0,
            },
        }
    }
}

// ---------------------------------------------------------------------
// PendingAutoAnalysis
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingAutoAnalysisStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Expired,
}

impl fmt::Display for PendingAutoAnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PendingAutoAnalysisStatus::Pending => "pending",
            PendingAutoAnalysisStatus::Processing => "processing",
            PendingAutoAnalysisStatus::Completed => "completed",
            PendingAutoAnalysisStatus::Failed => "failed",
            PendingAutoAnalysisStatus::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

impl FromStr for PendingAutoAnalysisStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => PendingAutoAnalysisStatus::Pending,
            "processing" => PendingAutoAnalysisStatus::Processing,
            "completed" => PendingAutoAnalysisStatus::Completed,
            "failed" => PendingAutoAnalysisStatus::Failed,
            "expired" => PendingAutoAnalysisStatus::Expired,
            other => anyhow::bail!("unknown pending auto-analysis status: {other}"),
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PendingAutoAnalysis {
    pub id: i64,
    pub feed_id: i64,
    pub item_ids_json: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub analysis_run_id: Option<i64>,
    pub error_message: Option<String>,
}

impl PendingAutoAnalysis {
    pub fn item_ids(&self) -> anyhow::Result<Vec<i64>> {
        Ok(serde_json::from_str(&self.item_ids_json)?)
    }
}

// ---------------------------------------------------------------------
// FeatureFlag
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlagState {
    Off,
    Canary,
    On,
    EmergencyOff,
}

impl fmt::Display for FlagState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FlagState::Off => "off",
            FlagState::Canary => "canary",
            FlagState::On => "on",
            FlagState::EmergencyOff => "emergency_off",
        };
        write!(f, "{s}")
    }
}

impl FromStr for FlagState {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "off" => FlagState::Off,
            "canary" => FlagState::Canary,
            "on" => FlagState::On,
            "emergency_off" => FlagState::EmergencyOff,
            other => anyhow::bail!("unknown feature flag state: {other}"),
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FeatureFlagRow {
    pub name: String,
    pub status: String,
    pub rollout_percentage: i64,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct FeedFetched {
    pub feed_id: i64,
    pub new_item_ids: Vec<i64>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStateChanged {
    pub run_id: i64,
    pub from: AnalysisRunStatusWire,
    pub to: AnalysisRunStatusWire,
    pub at: DateTime<Utc>,
}

/// Wire representation of `AnalysisRunStatus` for event payloads (kept
/// separate from the enum itself so event consumers see stable strings
/// even if internal variants are reordered).
pub type AnalysisRunStatusWire = String;
