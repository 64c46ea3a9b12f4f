//! AnalysisRunManager: the central authority for analysis run lifecycle —
//! preview, confirm (with admission control), execute, pause, resume,
//! cancel, emergency-stop/resume-all — and the single point that enforces
//! the global run caps from spec §5.
//!
//! Grounded on the teacher's job-lifecycle helpers in `processing.rs`
//! (status transitions through a SQL-backed state machine) generalized
//! into the full preview→confirm→execute contract, plus the pack's
//! semaphore-gated dispatcher style from the worker-pool grounding for slot
//! accounting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::events::{Event, EventBus};
use crate::model::{
    AnalysisRunParams, AnalysisRunStatus, RunPreview, RunScope, RunStateChanged, TriggeredBy,
};
use crate::store::Store;

#[derive(Debug, Error)]
pub enum RunManagerError {
    #[error("global run capacity exceeded")]
    CapacityExceeded,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct RunManagerConfig {
    pub max_concurrent_runs: u32,
    pub max_daily_runs: u32,
    pub max_daily_auto_runs: u32,
    pub max_hourly_runs: u32,
    pub analysis_batch_limit: u32,
    pub model_costs: HashMap<String, f64>,
}

pub struct AnalysisRunManager {
    store: Store,
    events: EventBus,
    config: RunManagerConfig,
    emergency_stopped: AtomicBool,
}

impl AnalysisRunManager {
    pub fn new(store: Store, events: EventBus, config: RunManagerConfig) -> Self {
        Self {
            store,
            events,
            config,
            emergency_stopped: AtomicBool::new(false),
        }
    }

    fn cost_per_item(&self, model_tag: &str) -> f64 {
        self.config
            .model_costs
            .get(model_tag)
            .copied()
            .unwrap_or(0.0)
    }

    /// Resolve `scope` into a concrete item-id list, bounded by `params.limit`
    /// (default 200, max 5000). Preview is authoritative for the run's item
    /// set — execute never re-resolves scope, avoiding drift (spec §9).
    async fn resolve_scope(&self, scope: &RunScope, limit: u32) -> anyhow::Result<Vec<i64>> {
        let limit = limit.clamp(0, 5000);
        if limit == 0 {
            return Ok(Vec::new());
        }
        match scope {
            RunScope::Global => self.store.items().all_ids(limit).await.map_err(Into::into),
            RunScope::Feeds { feed_ids } => self
                .store
                .items()
                .ids_for_feeds(feed_ids, limit)
                .await
                .map_err(Into::into),
            RunScope::Items { item_ids } => {
                Ok(item_ids.iter().take(limit as usize).copied().collect())
            }
            RunScope::TimeRange { start, end } => self
                .store
                .items()
                .ids_in_time_range(*start, *end, limit)
                .await
                .map_err(Into::into),
        }
    }

    /// Preview (create): resolves scope, filters already-analyzed items
    /// unless `override_existing`, estimates cost/duration, writes a
    /// `pending` row. Returns the preview summary (spec §4.7).
    pub async fn preview(
        &self,
        scope: RunScope,
        params: AnalysisRunParams,
    ) -> Result<RunPreview, RunManagerError> {
        let resolved = self.resolve_scope(&scope, params.limit).await?;

        let (candidate_ids, already_analyzed_count) = if params.override_existing {
            (resolved.clone(), 0u32)
        } else {
            let without = self
                .store
                .item_analysis()
                .without_analysis(&resolved)
                .await?;
            let already = resolved.len() as u32 - without.len() as u32;
            (without, already)
        };

        let item_count = candidate_ids.len() as u32;
        let cost_per_item = self.cost_per_item(&params.model_tag);
        let estimated_cost_usd = item_count as f64 * cost_per_item;
        let estimated_duration_seconds = if params.rate_per_second > 0.0 {
            item_count as f64 / params.rate_per_second
        } else {
            0.0
        };

        let run_id = self
            .store
            .analysis_runs()
            .create_pending(&scope, &params, estimated_cost_usd, item_count as i64)
            .await?;

        // A run with an empty resolved scope goes pending -> completed
        // immediately, with zero items (spec §8 boundary behavior).
        if item_count == 0 {
            self.store
                .analysis_runs()
                .transition(
                    run_id,
                    &[AnalysisRunStatus::Pending],
                    AnalysisRunStatus::Completed,
                )
                .await?;
        } else {
            self.store
                .analysis_run_items()
                .insert_queued_batch(run_id, &candidate_ids)
                .await?;
        }

        Ok(RunPreview {
            run_id,
            item_count,
            already_analyzed_count,
            new_items_count: item_count,
            estimated_cost_usd,
            estimated_duration_seconds,
        })
    }

    /// Confirm: `pending -> queued`, subject to admission control. If any
    /// cap is exceeded the run stays `queued` in the FIFO waiting queue;
    /// only auto callers receive `CapacityExceeded`.
    pub async fn confirm(&self, run_id: i64) -> Result<AnalysisRunStatus, RunManagerError> {
        let run = self.store.analysis_runs().get(run_id).await?;

        if run.status() != AnalysisRunStatus::Pending {
            return Ok(run.status());
        }

        let applied = self
            .store
            .analysis_runs()
            .transition(
                run_id,
                &[AnalysisRunStatus::Pending],
                AnalysisRunStatus::Queued,
            )
            .await?;
        if !applied {
            return Ok(self.store.analysis_runs().get(run_id).await?.status());
        }

        self.publish_transition(run_id, AnalysisRunStatus::Pending, AnalysisRunStatus::Queued);

        if run.triggered_by() == TriggeredBy::Auto && !self.admission_available(&run).await? {
            // Don't leave an admission-refused auto run sitting in the
            // waiting queue: the caller (the pending-analysis processor)
            // reverts its job to `pending` on CapacityExceeded and will
            // preview/confirm a fresh run for the same items next sweep,
            // which would double-analyze them if this one stayed queued
            // and later got promoted by `promote_waiting_queue`. Cancel it
            // instead so only the retried run ever executes.
            if self
                .store
                .analysis_runs()
                .transition(run_id, &[AnalysisRunStatus::Queued], AnalysisRunStatus::Cancelled)
                .await?
            {
                self.publish_transition(run_id, AnalysisRunStatus::Queued, AnalysisRunStatus::Cancelled);
            }
            return Err(RunManagerError::CapacityExceeded);
        }

        self.try_execute(run_id).await?;
        Ok(self.store.analysis_runs().get(run_id).await?.status())
    }

    async fn admission_available(&self, run: &crate::model::AnalysisRun) -> anyhow::Result<bool> {
        if self.emergency_stopped.load(Ordering::Acquire) {
            return Ok(false);
        }

        let running = self.store.analysis_runs().count_running().await?;
        if running as u32 >= self.config.max_concurrent_runs {
            return Ok(false);
        }

        let now = Utc::now();
        let daily_cap = if run.triggered_by() == TriggeredBy::Auto {
            self.config.max_daily_auto_runs
        } else {
            self.config.max_daily_runs
        };
        let daily_count = self
            .store
            .analysis_runs()
            .count_since(run.triggered_by(), now - chrono::Duration::hours(24))
            .await?;
        if daily_count as u32 >= daily_cap {
            return Ok(false);
        }

        let hourly_count = self
            .store
            .analysis_runs()
            .count_since(run.triggered_by(), now - chrono::Duration::hours(1))
            .await?;
        if hourly_count as u32 >= self.config.max_hourly_runs {
            return Ok(false);
        }

        Ok(true)
    }

    /// Attempt to move a `queued` run to `running` if a slot is free.
    /// Called after confirm and after any terminal transition frees a slot.
    pub async fn try_execute(&self, run_id: i64) -> anyhow::Result<bool> {
        let run = self.store.analysis_runs().get(run_id).await?;
        if run.status() != AnalysisRunStatus::Queued {
            return Ok(false);
        }
        if !self.admission_available(&run).await? {
            return Ok(false);
        }

        let applied = self
            .store
            .analysis_runs()
            .transition(
                run_id,
                &[AnalysisRunStatus::Queued],
                AnalysisRunStatus::Running,
            )
            .await?;
        if applied {
            info!(run_id, "analysis run transitioned to running");
            self.publish_transition(run_id, AnalysisRunStatus::Queued, AnalysisRunStatus::Running);
        }
        Ok(applied)
    }

    /// Sweep the waiting queue and promote as many runs as slots allow.
    /// Called periodically by the worker pool dispatcher.
    pub async fn promote_waiting_queue(&self) -> anyhow::Result<()> {
        if self.emergency_stopped.load(Ordering::Acquire) {
            return Ok(());
        }
        for run in self.store.analysis_runs().waiting_queue().await? {
            if !self.try_execute(run.id).await? {
                // First still-blocked run means the remaining FIFO entries
                // are blocked too (caps only get tighter further down);
                // keep checking in case an earlier run wasn't actually
                // capacity-blocked (e.g. a per-trigger cap only affects
                // some entries).
                continue;
            }
        }
        Ok(())
    }

    pub async fn pause(&self, run_id: i64) -> anyhow::Result<bool> {
        let applied = self
            .store
            .analysis_runs()
            .transition(run_id, &[AnalysisRunStatus::Running], AnalysisRunStatus::Paused)
            .await?;
        if applied {
            self.publish_transition(run_id, AnalysisRunStatus::Running, AnalysisRunStatus::Paused);
        }
        Ok(applied)
    }

    pub async fn resume(&self, run_id: i64) -> anyhow::Result<bool> {
        let applied = self
            .store
            .analysis_runs()
            .transition(run_id, &[AnalysisRunStatus::Paused], AnalysisRunStatus::Running)
            .await?;
        if applied {
            self.publish_transition(run_id, AnalysisRunStatus::Paused, AnalysisRunStatus::Running);
        }
        Ok(applied)
    }

    /// Cancel from {queued, running, paused}. In-flight items are allowed
    /// to complete; further queued items are not started (worker pool
    /// enforces this by checking run state before each pull).
    pub async fn cancel(&self, run_id: i64) -> anyhow::Result<bool> {
        let from = [
            AnalysisRunStatus::Queued,
            AnalysisRunStatus::Running,
            AnalysisRunStatus::Paused,
        ];
        let before = self.store.analysis_runs().get(run_id).await?.status();
        let applied = self
            .store
            .analysis_runs()
            .transition(run_id, &from, AnalysisRunStatus::Cancelled)
            .await?;
        if applied {
            self.publish_transition(run_id, before, AnalysisRunStatus::Cancelled);
        }
        Ok(applied)
    }

    /// All non-terminal runs -> paused; new confirmations are refused until
    /// `resume_all()`.
    pub async fn emergency_stop(&self) -> anyhow::Result<()> {
        warn!("emergency stop: pausing all non-terminal analysis runs");
        self.emergency_stopped.store(true, Ordering::Release);
        for run in self.store.analysis_runs().non_terminal_runs().await? {
            let status = run.status();
            if status == AnalysisRunStatus::Running {
                if self
                    .store
                    .analysis_runs()
                    .transition(run.id, &[AnalysisRunStatus::Running], AnalysisRunStatus::Paused)
                    .await?
                {
                    self.publish_transition(run.id, AnalysisRunStatus::Running, AnalysisRunStatus::Paused);
                }
            }
        }
        Ok(())
    }

    pub async fn resume_all(&self) -> anyhow::Result<()> {
        info!("resuming all paused analysis runs after emergency stop");
        self.emergency_stopped.store(false, Ordering::Release);
        for run in self.store.analysis_runs().non_terminal_runs().await? {
            if run.status() == AnalysisRunStatus::Paused {
                if self
                    .store
                    .analysis_runs()
                    .transition(run.id, &[AnalysisRunStatus::Paused], AnalysisRunStatus::Running)
                    .await?
                {
                    self.publish_transition(run.id, AnalysisRunStatus::Paused, AnalysisRunStatus::Running);
                }
            }
        }
        self.promote_waiting_queue().await
    }

    /// Called by the worker pool once every `analysis_run_items` row for a
    /// run is terminal. Computes the final status and actual cost.
    pub async fn finalize_if_complete(&self, run_id: i64) -> anyhow::Result<()> {
        let counts = self.store.analysis_run_items().counts_by_state(run_id).await?;
        let total: i64 = counts.iter().map(|(_, n)| n).sum();
        if total == 0 {
            return Ok(());
        }
        let terminal_states = ["completed", "failed", "skipped", "cancelled"];
        let terminal_count: i64 = counts
            .iter()
            .filter(|(s, _)| terminal_states.contains(&s.as_str()))
            .map(|(_, n)| n)
            .sum();
        if terminal_count != total {
            return Ok(());
        }

        let failed_count = counts
            .iter()
            .find(|(s, _)| s == "failed")
            .map(|(_, n)| *n)
            .unwrap_or(0);

        let final_status = if failed_count == total {
            AnalysisRunStatus::Failed
        } else {
            AnalysisRunStatus::Completed
        };

        let actual_cost = self.store.analysis_run_items().total_cost(run_id).await?;
        sqlx::query("UPDATE analysis_runs SET actual_cost_usd = ? WHERE id = ?")
            .bind(actual_cost)
            .bind(run_id)
            .execute(self.store.pool())
            .await?;

        let before = self.store.analysis_runs().get(run_id).await?.status();
        let applied = self
            .store
            .analysis_runs()
            .transition(
                run_id,
                &[AnalysisRunStatus::Running, AnalysisRunStatus::Paused],
                final_status,
            )
            .await?;
        if applied {
            if final_status == AnalysisRunStatus::Failed {
                self.store
                    .analysis_runs()
                    .set_last_error(run_id, "all items failed")
                    .await?;
            }
            self.publish_transition(run_id, before, final_status);
            self.promote_waiting_queue().await?;
        }
        Ok(())
    }

    fn publish_transition(&self, run_id: i64, from: AnalysisRunStatus, to: AnalysisRunStatus) {
        self.events.publish(Event::RunStateChanged(RunStateChanged {
            run_id,
            from: from.to_string(),
            to: to.to_string(),
            at: Utc::now(),
        }));
    }

    pub fn default_batch_limit(&self) -> u32 {
        self.config.analysis_batch_limit
    }
}
