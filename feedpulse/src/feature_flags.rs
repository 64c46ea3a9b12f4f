//! Process-wide feature flag registry: rollout-percentage bucketing plus an
//! error-rate/latency circuit breaker that auto-trips a flag to
//! `emergency_off`.
//!
//! Grounded on the pack's lock-free `DeploymentState` (atomic counters,
//! `Ordering::Relaxed`, EMA latency) for the per-flag metrics, and on the
//! teacher's storage-backed config for checkpointing state across restarts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::events::{Event, EventBus};
use crate::model::FlagState;
use crate::store::Store;

const WINDOW_TRIP_MIN_COUNT: u32 = 20;
const ERROR_RATE_TRIP_THRESHOLD: f64 = 0.05;
const LATENCY_TRIP_MULTIPLIER: f64 = 1.5;
const CONSECUTIVE_FAILURE_TRIP_THRESHOLD: u32 = 3;

fn state_to_u8(s: FlagState) -> u8 {
    match s {
        FlagState::Off => 0,
        FlagState::Canary => 1,
        FlagState::On => 2,
        FlagState::EmergencyOff => 3,
    }
}

fn u8_to_state(v: u8) -> FlagState {
    match v {
        0 => FlagState::Off,
        1 => FlagState::Canary,
        2 => FlagState::On,
        _ => FlagState::EmergencyOff,
    }
}

/// Lock-free runtime state for a single flag. Counters reset the rolling
/// window once `WINDOW_TRIP_MIN_COUNT` samples accumulate, the way a
/// sliding approximation (not an exact sliding window) is cheap to keep
/// lock-free.
struct FlagRuntime {
    state: AtomicU8,
    rollout_percentage: AtomicU8,
    window_count: AtomicU32,
    window_failures: AtomicU32,
    consecutive_failures: AtomicU32,
    ewma_latency_ms: AtomicU64, // fixed-point *1000
    baseline_latency_ms: AtomicU64,
}

impl FlagRuntime {
    fn new(state: FlagState, rollout_percentage: u8) -> Self {
        Self {
            state: AtomicU8::new(state_to_u8(state)),
            rollout_percentage: AtomicU8::new(rollout_percentage),
            window_count: AtomicU32::new(0),
            window_failures: AtomicU32::new(0),
            consecutive_failures: AtomicU32::new(0),
            ewma_latency_ms: AtomicU64::new(0),
            baseline_latency_ms: AtomicU64::new(0),
        }
    }

    fn state(&self) -> FlagState {
        u8_to_state(self.state.load(Ordering::Relaxed))
    }
}

/// Process-wide registry. Cheap to clone (wraps an `Arc`).
#[derive(Clone)]
pub struct FeatureFlags {
    flags: Arc<RwLock<HashMap<String, Arc<FlagRuntime>>>>,
    events: EventBus,
    store: Option<Store>,
}

impl FeatureFlags {
    pub fn new(events: EventBus) -> Self {
        Self {
            flags: Arc::new(RwLock::new(HashMap::new())),
            events,
            store: None,
        }
    }

    /// Attach a store so state/rollout changes are checkpointed and survive
    /// a restart (spec §4.2; see `store::feature_flags::checkpoint`).
    pub fn with_store(mut self, store: Store) -> Self {
        self.store = Some(store);
        self
    }

    /// Fire-and-forget persistence of a flag's current state, so an
    /// emergency trip or an admin action isn't silently lost on restart.
    fn spawn_checkpoint(&self, name: &str, state: FlagState, rollout_percentage: u8) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = store
                .feature_flags()
                .checkpoint(&name, &state.to_string(), rollout_percentage)
                .await
            {
                warn!(flag = %name, error = %e, "failed to checkpoint feature flag state");
            }
        });
    }

    /// Register a flag's initial state, overwriting any prior registration
    /// under the same name. Called once from config, then again per
    /// persisted checkpoint row on startup — the checkpoint (which may
    /// record an emergency-tripped flag) must win over the config default,
    /// so this always applies the given state rather than only seeding it
    /// the first time.
    pub fn register(&self, name: &str, state: FlagState, rollout_percentage: u8) {
        let mut flags = self.flags.write().unwrap();
        flags.insert(name.to_string(), Arc::new(FlagRuntime::new(state, rollout_percentage)));
    }

    fn get_or_default(&self, name: &str) -> Arc<FlagRuntime> {
        if let Some(existing) = self.flags.read().unwrap().get(name) {
            return existing.clone();
        }
        let mut flags = self.flags.write().unwrap();
        flags
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(FlagRuntime::new(FlagState::Off, 0)))
            .clone()
    }

    /// Deterministic hash of `bucket_key` modulo 100, compared to the
    /// flag's rollout percentage.
    pub fn is_enabled(&self, flag_name: &str, bucket_key: &str) -> bool {
        let runtime = self.get_or_default(flag_name);
        match runtime.state() {
            FlagState::Off | FlagState::EmergencyOff => false,
            FlagState::On => true,
            FlagState::Canary => {
                let bucket = bucket_of(bucket_key);
                let pct = runtime.rollout_percentage.load(Ordering::Relaxed);
                bucket < pct
            }
        }
    }

    /// Record a call outcome for the circuit breaker. Evaluated on every
    /// call per spec §4.2.
    pub fn record_metric(&self, flag_name: &str, success: bool, latency_ms: u64) {
        let runtime = self.get_or_default(flag_name);

        if success {
            runtime.consecutive_failures.store(0, Ordering::Relaxed);
        } else {
            runtime.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        }

        let count = runtime.window_count.fetch_add(1, Ordering::Relaxed) + 1;
        if !success {
            runtime.window_failures.fetch_add(1, Ordering::Relaxed);
        }

        // EMA with alpha = 0.2, same shape as the pack's deployment latency
        // tracker: new = (new*1 + old*4) / 5.
        let prev = runtime.ewma_latency_ms.load(Ordering::Relaxed);
        let next = if prev == 0 {
            latency_ms * 1000
        } else {
            (latency_ms * 1000 + 4 * prev) / 5
        };
        runtime.ewma_latency_ms.store(next, Ordering::Relaxed);
        runtime
            .baseline_latency_ms
            .compare_exchange(0, next, Ordering::Relaxed, Ordering::Relaxed)
            .ok();

        if count >= WINDOW_TRIP_MIN_COUNT {
            self.evaluate_trip(flag_name, &runtime, count);
            // Reset the approximate window so thresholds are evaluated
            // against fresh samples going forward.
            runtime.window_count.store(0, Ordering::Relaxed);
            runtime.window_failures.store(0, Ordering::Relaxed);
        }
    }

    fn evaluate_trip(&self, flag_name: &str, runtime: &FlagRuntime, count: u32) {
        if runtime.state() == FlagState::EmergencyOff {
            return;
        }
        let failures = runtime.window_failures.load(Ordering::Relaxed);
        let error_rate = failures as f64 / count as f64;
        let ewma = runtime.ewma_latency_ms.load(Ordering::Relaxed) as f64 / 1000.0;
        let baseline = runtime.baseline_latency_ms.load(Ordering::Relaxed) as f64 / 1000.0;
        let latency_tripped = baseline > 0.0 && ewma > baseline * LATENCY_TRIP_MULTIPLIER;
        let consecutive = runtime.consecutive_failures.load(Ordering::Relaxed);

        if error_rate > ERROR_RATE_TRIP_THRESHOLD
            || latency_tripped
            || consecutive > CONSECUTIVE_FAILURE_TRIP_THRESHOLD
        {
            runtime
                .state
                .store(state_to_u8(FlagState::EmergencyOff), Ordering::Relaxed);
            warn!(
                flag = flag_name,
                error_rate,
                ewma_latency_ms = ewma,
                consecutive,
                "feature flag auto-tripped to emergency_off"
            );
            self.events.publish(Event::RunStateChanged(crate::model::RunStateChanged {
                run_id: -1,
                from: "n/a".to_string(),
                to: format!("flag:{flag_name}:emergency_off"),
                at: chrono::Utc::now(),
            }));
            self.spawn_checkpoint(
                flag_name,
                FlagState::EmergencyOff,
                runtime.rollout_percentage.load(Ordering::Relaxed),
            );
        }
    }

    /// Admin action. `emergency_off` requires this explicit call to reset,
    /// per spec §4.2.
    pub fn set_state(&self, flag_name: &str, state: FlagState) {
        let runtime = self.get_or_default(flag_name);
        info!(flag = flag_name, ?state, "feature flag state set explicitly");
        runtime.state.store(state_to_u8(state), Ordering::Relaxed);
        if state != FlagState::EmergencyOff {
            runtime.consecutive_failures.store(0, Ordering::Relaxed);
            runtime.window_count.store(0, Ordering::Relaxed);
            runtime.window_failures.store(0, Ordering::Relaxed);
        }
        self.spawn_checkpoint(flag_name, state, runtime.rollout_percentage.load(Ordering::Relaxed));
    }

    pub fn set_rollout_percentage(&self, flag_name: &str, pct: u8) {
        let runtime = self.get_or_default(flag_name);
        let pct = pct.min(100);
        runtime.rollout_percentage.store(pct, Ordering::Relaxed);
        self.spawn_checkpoint(flag_name, runtime.state(), pct);
    }

    pub fn state_of(&self, flag_name: &str) -> FlagState {
        self.get_or_default(flag_name).state()
    }
}

fn bucket_of(bucket_key: &str) -> u8 {
    let mut hasher = Sha256::new();
    hasher.update(bucket_key.as_bytes());
    let digest = hasher.finalize();
    let mut acc: u64 = 0;
    for byte in &digest[..8] {
        acc = (acc << 8) | *byte as u64;
    }
    (acc % 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_short_circuits_to_false() {
        let flags = FeatureFlags::new(EventBus::default());
        flags.register("items_repo", FlagState::Off, 0);
        assert!(!flags.is_enabled("items_repo", "feed:1"));
    }

    #[test]
    fn on_short_circuits_to_true() {
        let flags = FeatureFlags::new(EventBus::default());
        flags.register("items_repo", FlagState::On, 0);
        assert!(flags.is_enabled("items_repo", "feed:1"));
    }

    #[test]
    fn canary_is_deterministic_for_a_given_key() {
        let flags = FeatureFlags::new(EventBus::default());
        flags.register("items_repo", FlagState::Canary, 50);
        let first = flags.is_enabled("items_repo", "feed:42");
        let second = flags.is_enabled("items_repo", "feed:42");
        assert_eq!(first, second);
    }

    #[test]
    fn high_error_rate_trips_to_emergency_off() {
        let flags = FeatureFlags::new(EventBus::default());
        flags.register("items_repo", FlagState::On, 100);
        for _ in 0..18 {
            flags.record_metric("items_repo", true, 10);
        }
        for _ in 0..2 {
            flags.record_metric("items_repo", false, 10);
        }
        assert_eq!(flags.state_of("items_repo"), FlagState::EmergencyOff);
        assert!(!flags.is_enabled("items_repo", "feed:1"));
    }

    #[test]
    fn emergency_off_requires_explicit_reset() {
        let flags = FeatureFlags::new(EventBus::default());
        flags.register("items_repo", FlagState::EmergencyOff, 0);
        for _ in 0..30 {
            flags.record_metric("items_repo", true, 1);
        }
        assert_eq!(flags.state_of("items_repo"), FlagState::EmergencyOff);
        flags.set_state("items_repo", FlagState::On);
        assert_eq!(flags.state_of("items_repo"), FlagState::On);
    }
}
