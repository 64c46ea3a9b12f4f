//! Per-run async token bucket.
//!
//! Grounded in the atomic-counter style used for deployment health tracking
//! in the pack (lock-free counters updated with `Ordering::Relaxed`, no
//! external rate-limiting crate): capacity and refill are tracked as a
//! fixed-point token count (`tokens * SCALE`) so fractional refill rates
//! (e.g. 1.5/s) don't need floating-point atomics.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

const SCALE: i64 = 1_000;

/// A shared rate limiter for all workers assigned to one analysis run.
pub struct TokenBucket {
    capacity: i64,       // scaled tokens
    refill_per_sec: f64, // tokens/sec, unscaled
    tokens: AtomicI64,   // scaled tokens currently available
    last_refill_nanos: AtomicU64,
    start: Instant,
}

impl TokenBucket {
    /// `rate_per_second` is the refill rate; capacity is `ceil(rate_per_second)`
    /// tokens, per spec §4.8. The bucket starts empty so the first `capacity`
    /// calls don't get a free burst — wall-clock for N calls is `N / rate_per_second`.
    pub fn new(rate_per_second: f64) -> Self {
        let capacity_tokens = rate_per_second.ceil().max(1.0) as i64;
        let capacity = capacity_tokens * SCALE;
        Self {
            capacity,
            refill_per_sec: rate_per_second.max(0.01),
            tokens: AtomicI64::new(0),
            last_refill_nanos: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    fn refill(&self) {
        let now_nanos = self.start.elapsed().as_nanos() as u64;
        let prev = self.last_refill_nanos.swap(now_nanos, Ordering::AcqRel);
        if now_nanos <= prev {
            return;
        }
        let elapsed_secs = (now_nanos - prev) as f64 / 1_000_000_000.0;
        let gained = (elapsed_secs * self.refill_per_sec * SCALE as f64) as i64;
        if gained <= 0 {
            return;
        }
        let mut current = self.tokens.load(Ordering::Acquire);
        loop {
            let next = (current + gained).min(self.capacity);
            match self.tokens.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Consume one token, sleeping (with jitter-free backoff polling) until
    /// one becomes available. Used once per LLM call by each worker.
    pub async fn acquire(&self) {
        loop {
            self.refill();
            let current = self.tokens.load(Ordering::Acquire);
            if current >= SCALE {
                if self
                    .tokens
                    .compare_exchange(
                        current,
                        current - SCALE,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            // Not enough tokens: sleep roughly until the next token is due.
            let deficit = SCALE - current;
            let wait_secs = deficit as f64 / (SCALE as f64 * self.refill_per_sec);
            let wait = Duration::from_secs_f64(wait_secs.clamp(0.005, 1.0));
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_acquire_waits_for_a_refill_rather_than_bursting() {
        let bucket = TokenBucket::new(2.0);
        let start = Instant::now();
        bucket.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn refill_eventually_grants_a_token() {
        let bucket = TokenBucket::new(20.0);
        for _ in 0..20 {
            bucket.acquire().await;
        }
        let start = Instant::now();
        bucket.acquire().await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
