//! AnalysisWorkerPool: pulls queued items off `running` analysis runs,
//! rate-limits per run, calls the LLM, validates the JSON schema (with one
//! repair retry), and writes the terminal outcome back through the store.
//!
//! Grounded on the teacher's semaphore-bounded dispatcher shape from
//! `scheduler.rs` (claim-then-spawn, `tokio::select!` against a shutdown
//! `Notify`), generalized from "one fetch per feed" to "one LLM call per
//! queued run item", with retry/backoff classification driven by
//! `LlmError::kind()` (spec §4.8, §7).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, Semaphore};
use tracing::{debug, error, info, warn};

use crate::llm::{LlmProvider, LlmRequest};
use crate::model::{AnalysisResult, AnalysisRunStatus, Item};
use crate::rate_limiter::TokenBucket;
use crate::run_manager::AnalysisRunManager;
use crate::store::Store;

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_SECONDS: [u64; 3] = [1, 4, 16];
const MAX_PROMPT_CHARS: usize = 8_000;

pub struct AnalysisWorkerPoolConfig {
    pub per_run_workers: u32,
    pub max_concurrent_runs: u32,
    pub dispatch_tick: Duration,
    pub llm_timeout_seconds: u64,
    pub model_costs: HashMap<String, f64>,
}

pub struct AnalysisWorkerPool {
    store: Store,
    run_manager: Arc<AnalysisRunManager>,
    llm: Arc<dyn LlmProvider>,
    config: AnalysisWorkerPoolConfig,
    semaphore: Arc<Semaphore>,
    rate_limiters: Mutex<HashMap<i64, Arc<TokenBucket>>>,
}

impl AnalysisWorkerPool {
    pub fn new(
        store: Store,
        run_manager: Arc<AnalysisRunManager>,
        llm: Arc<dyn LlmProvider>,
        config: AnalysisWorkerPoolConfig,
    ) -> Self {
        let total_slots = (config.max_concurrent_runs * config.per_run_workers).max(1) as usize;
        Self {
            store,
            run_manager,
            llm,
            semaphore: Arc::new(Semaphore::new(total_slots)),
            config,
            rate_limiters: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run(&self, shutdown: Arc<Notify>) {
        loop {
            if let Err(e) = self.dispatch_once().await {
                error!(error = %e, "worker pool dispatch tick failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.dispatch_tick) => {}
                _ = shutdown.notified() => {
                    info!("worker pool: shutdown requested, exiting loop");
                    break;
                }
            }
        }
    }

    /// One dispatcher pass: for every `running` run, claim up to
    /// `per_run_workers` queued items and spawn one worker task per item,
    /// bounded by the pool-wide semaphore.
    pub async fn dispatch_once(&self) -> anyhow::Result<()> {
        let runs = self.store.analysis_runs().running_runs().await?;
        if runs.is_empty() {
            return Ok(());
        }

        let mut handles = Vec::new();
        for run in runs {
            let claimed = self
                .store
                .analysis_run_items()
                .claim_queued(run.id, self.config.per_run_workers)
                .await?;
            if claimed.is_empty() {
                continue;
            }
            debug!(run_id = run.id, count = claimed.len(), "worker pool claimed items");

            let bucket = self.rate_limiter_for(run.id, run.rate_per_second).await;
            let cost_per_item = self
                .config
                .model_costs
                .get(&run.model_tag)
                .copied()
                .unwrap_or(0.0);

            for item_id in claimed {
                let semaphore = self.semaphore.clone();
                let store = self.store.clone();
                let run_manager = self.run_manager.clone();
                let llm = self.llm.clone();
                let bucket = bucket.clone();
                let model_tag = run.model_tag.clone();
                let timeout_seconds = self.config.llm_timeout_seconds;
                let run_id = run.id;

                let handle = tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    if let Err(e) = process_item(
                        &store,
                        &run_manager,
                        llm.as_ref(),
                        &bucket,
                        run_id,
                        item_id,
                        &model_tag,
                        cost_per_item,
                        timeout_seconds,
                    )
                    .await
                    {
                        error!(run_id, item_id, error = %e, "worker failed to process run item");
                    }
                });
                handles.push(handle);
            }
        }

        for handle in handles {
            let _ = handle.await;
        }

        self.run_manager.promote_waiting_queue().await?;
        self.cleanup_rate_limiters().await?;
        Ok(())
    }

    async fn rate_limiter_for(&self, run_id: i64, rate_per_second: f64) -> Arc<TokenBucket> {
        let mut limiters = self.rate_limiters.lock().await;
        limiters
            .entry(run_id)
            .or_insert_with(|| Arc::new(TokenBucket::new(rate_per_second)))
            .clone()
    }

    /// Drop rate limiters for runs that are no longer running, so a
    /// long-lived process doesn't accumulate one bucket per historical run.
    async fn cleanup_rate_limiters(&self) -> anyhow::Result<()> {
        let running = self.store.analysis_runs().running_runs().await?;
        let running_ids: std::collections::HashSet<i64> = running.iter().map(|r| r.id).collect();
        let mut limiters = self.rate_limiters.lock().await;
        limiters.retain(|run_id, _| running_ids.contains(run_id));
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_item(
    store: &Store,
    run_manager: &AnalysisRunManager,
    llm: &dyn LlmProvider,
    bucket: &TokenBucket,
    run_id: i64,
    item_id: i64,
    model_tag: &str,
    cost_per_item: f64,
    timeout_seconds: u64,
) -> anyhow::Result<()> {
    match run_status(store, run_id).await? {
        AnalysisRunStatus::Paused => {
            store
                .analysis_run_items()
                .transition(run_id, item_id, &["processing"], "queued", None, None, None)
                .await?;
            return Ok(());
        }
        AnalysisRunStatus::Cancelled => {
            store
                .analysis_run_items()
                .transition(run_id, item_id, &["processing"], "skipped", None, None, None)
                .await?;
            return Ok(());
        }
        _ => {}
    }

    let item = store.items().get(item_id).await?;
    let prompt = build_prompt(&item);

    let mut attempt_result: Result<(AnalysisResult, usize), String> =
        Err("not attempted".to_string());

    for attempt in 1..=MAX_ATTEMPTS {
        bucket.acquire().await;

        let request = LlmRequest {
            prompt: prompt.clone(),
            max_tokens: Some(800),
            temperature: Some(0.2),
            timeout_seconds: Some(timeout_seconds),
        };

        match llm.generate(request).await {
            Ok(response) => match parse_analysis(&response.content) {
                Ok(result) => {
                    attempt_result = Ok((result, response.usage.total_tokens));
                    break;
                }
                Err(_) => {
                    // One repair retry: ask the model to fix its own output.
                    let repair_prompt = build_repair_prompt(&prompt, &response.content);
                    let repair_request = LlmRequest {
                        prompt: repair_prompt,
                        max_tokens: Some(800),
                        temperature: Some(0.0),
                        timeout_seconds: Some(timeout_seconds),
                    };
                    match llm.generate(repair_request).await {
                        Ok(repaired) => match parse_analysis(&repaired.content) {
                            Ok(result) => {
                                attempt_result = Ok((result, repaired.usage.total_tokens));
                                break;
                            }
                            Err(e) => {
                                attempt_result = Err(format!("invalid_json: {e}"));
                                break;
                            }
                        },
                        Err(e) => {
                            attempt_result = Err(format!("invalid_json (repair call failed: {e})"));
                            break;
                        }
                    }
                }
            },
            Err(e) => {
                attempt_result = Err(format!("{}: {e}", e.kind()));
                if e.is_retryable() && attempt < MAX_ATTEMPTS {
                    let delay = BACKOFF_SECONDS[(attempt - 1) as usize];
                    warn!(run_id, item_id, attempt, delay, error = %e, "retrying analysis after error");
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    continue;
                }
                break;
            }
        }
    }

    match attempt_result {
        Ok((result, tokens_used)) => {
            store.item_analysis().upsert(item_id, &result, model_tag).await?;
            store
                .analysis_run_items()
                .transition(
                    run_id,
                    item_id,
                    &["processing"],
                    "completed",
                    Some(tokens_used as i64),
                    Some(cost_per_item),
                    None,
                )
                .await?;
            store
                .analysis_runs()
                .increment_counters(run_id, 1, 0, cost_per_item)
                .await?;
        }
        Err(error_message) => {
            warn!(run_id, item_id, error = %error_message, "analysis item exhausted retries, writing fallback");
            let fallback = AnalysisResult::neutral_fallback();
            store.item_analysis().upsert(item_id, &fallback, model_tag).await?;
            store
                .analysis_run_items()
                .transition(
                    run_id,
                    item_id,
                    &["processing"],
                    "failed",
                    None,
                    None,
                    Some(&error_message),
                )
                .await?;
            store
                .analysis_runs()
                .increment_counters(run_id, 1, 1, 0.0)
                .await?;
        }
    }

    run_manager.finalize_if_complete(run_id).await?;
    Ok(())
}

async fn run_status(store: &Store, run_id: i64) -> anyhow::Result<AnalysisRunStatus> {
    Ok(store.analysis_runs().get(run_id).await?.status())
}

fn build_prompt(item: &Item) -> String {
    let title = item.title.as_deref().unwrap_or("(no title)");
    let description = item.description.as_deref().unwrap_or("");
    let body = item.content.as_deref().unwrap_or("");

    let mut combined = format!("{title}\n\n{description}\n\n{body}");
    if combined.len() > MAX_PROMPT_CHARS {
        combined.truncate(MAX_PROMPT_CHARS);
    }

    format!(
        r#"You are a financial-news and geopolitical-risk analyst. Analyze the article below and respond with STRICT JSON matching exactly this shape (no prose, no markdown fence):

{{
  "sentiment": {{
    "overall": {{"label": "positive|neutral|negative", "score": -1.0..1.0, "confidence": 0.0..1.0}},
    "market": {{"bullish": 0.0..1.0, "bearish": 0.0..1.0, "uncertainty": 0.0..1.0, "time_horizon": "short|medium|long"}},
    "urgency": 0.0..1.0,
    "themes": ["string", ...],
    "geopolitical": {{
      "stability_score": -1.0..1.0,
      "economic_impact": 0.0..1.0,
      "security_relevance": 0.0..1.0,
      "diplomatic_impact": {{"global": 0.0..1.0, "western": 0.0..1.0, "regional": 0.0..1.0}},
      "escalation_potential": 0.0..1.0,
      "regions_affected": ["string", ...],
      "impact_beneficiaries": ["string", ...],
      "impact_affected": ["string", ...],
      "time_horizon": "short_term|medium_term|long_term",
      "confidence": 0.0..1.0,
      "alliance_activation": ["string", ...],
      "conflict_type": "diplomatic|economic|military|hybrid"
    }}
  }},
  "impact": {{"overall": 0.0..1.0, "volatility": 0.0..1.0}}
}}

If the article has no geopolitical dimension, set every field in "geopolitical" to its zero/empty value and confidence to 0.

ARTICLE:
{combined}
"#
    )
}

fn build_repair_prompt(original_prompt: &str, bad_response: &str) -> String {
    format!(
        "{original_prompt}\n\nYour previous response was not valid JSON matching the required schema:\n{bad_response}\n\nRespond again with ONLY the corrected JSON object, no commentary."
    )
}

fn parse_analysis(content: &str) -> anyhow::Result<AnalysisResult> {
    let json_str = crate::llm::extract_json_from_text(content)
        .ok_or_else(|| anyhow::anyhow!("no JSON object found in LLM response"))?;
    let result: AnalysisResult = serde_json::from_str(&json_str)?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item() -> Item {
        Item {
            id: 1,
            feed_id: 1,
            title: Some("Central bank raises rates".to_string()),
            link: Some("https://example.com/a".to_string()),
            description: Some("Summary of the hike".to_string()),
            content: Some("Full article body".to_string()),
            author: None,
            published_at: None,
            guid: None,
            content_hash: "abc".to_string(),
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn build_prompt_includes_title_and_schema_markers() {
        let prompt = build_prompt(&sample_item());
        assert!(prompt.contains("Central bank raises rates"));
        assert!(prompt.contains("\"geopolitical\""));
    }

    #[test]
    fn parse_analysis_accepts_fenced_json() {
        let neutral = AnalysisResult::neutral_fallback();
        let body = serde_json::to_string(&neutral).unwrap();
        let wrapped = format!("Sure, here's the analysis:\n```json\n{body}\n```");
        let parsed = parse_analysis(&wrapped).unwrap();
        assert_eq!(parsed.impact.overall, 0.0);
    }

    #[test]
    fn parse_analysis_rejects_non_json() {
        assert!(parse_analysis("not json at all").is_err());
    }
}
