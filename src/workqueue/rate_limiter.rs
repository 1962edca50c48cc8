//! Per-key rate limiters deciding how long a re-added key waits.

use crate::backoff::Backoff;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Decides the delay before a key may be handed out again.
pub trait RateLimiter: Send + Sync + fmt::Debug {
    /// Delay for the next re-add of `key`. Counts as one more requeue.
    fn when(&self, key: &str) -> Duration;
    /// Drop all history for `key`.
    fn forget(&self, key: &str);
    /// How many times `key` has been re-added since it was last forgotten.
    fn num_requeues(&self, key: &str) -> usize;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exponential per-key backoff: `base * 2^requeues`, capped.
#[derive(Debug)]
pub struct ItemBackoffLimiter {
    backoff: Backoff,
    failures: Mutex<HashMap<String, usize>>,
}

impl ItemBackoffLimiter {
    pub fn new(backoff: Backoff) -> Self {
        Self { backoff, failures: Mutex::new(HashMap::new()) }
    }
}

impl RateLimiter for ItemBackoffLimiter {
    fn when(&self, key: &str) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(key.to_string()).or_insert(0);
        let delay = self.backoff.delay(*count);
        *count += 1;
        delay
    }

    fn forget(&self, key: &str) {
        lock(&self.failures).remove(key);
    }

    fn num_requeues(&self, key: &str) -> usize {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket shared by every key: `qps` refill, `burst` capacity.
///
/// A reservation always succeeds; when the bucket is empty the returned delay is how long
/// the caller must wait for its token.
#[derive(Debug)]
pub struct BucketLimiter {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl BucketLimiter {
    pub fn new(qps: f64, burst: usize) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            state: Mutex::new(BucketState { tokens: burst, last: Instant::now() }),
        }
    }

    fn reserve(&self) -> Duration {
        let mut state = lock(&self.state);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.qps).min(self.burst) - 1.0;
        state.last = now;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.qps)
        }
    }
}

impl RateLimiter for BucketLimiter {
    fn when(&self, _key: &str) -> Duration {
        self.reserve()
    }

    fn forget(&self, _key: &str) {}

    fn num_requeues(&self, _key: &str) -> usize {
        0
    }
}

/// Worst case of several limiters.
#[derive(Debug)]
pub struct MaxOfLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfLimiter {
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfLimiter {
    fn when(&self, key: &str) -> Duration {
        self.limiters.iter().map(|l| l.when(key)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &str) {
        for l in &self.limiters {
            l.forget(key);
        }
    }

    fn num_requeues(&self, key: &str) -> usize {
        self.limiters.iter().map(|l| l.num_requeues(key)).max().unwrap_or(0)
    }
}

/// Limiter used by node pools: per-key exponential backoff combined with an overall bucket.
pub fn node_queue_limiter(backoff: Backoff, qps: f64, burst: usize) -> MaxOfLimiter {
    MaxOfLimiter::new(vec![
        Box::new(ItemBackoffLimiter::new(backoff)),
        Box::new(BucketLimiter::new(qps, burst)),
    ])
}
