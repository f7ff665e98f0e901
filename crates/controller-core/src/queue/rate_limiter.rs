//! Requeue delay policies.
//!
//! The default controller limiter is the maximum of a per-key exponential
//! backoff and a global token bucket.

use crate::backoff::ExponentialBackoff;
use crate::key::ObjectKey;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Decides how long a key waits before it is re-queued.
pub trait RateLimiter: Send + Sync + Debug {
    /// Delay before `key` may be processed again. Records one more failure.
    fn when(&self, key: &ObjectKey) -> Duration;

    /// Drops all state kept for `key`.
    fn forget(&self, key: &ObjectKey);

    /// Failures recorded for `key` since it was last forgotten.
    fn num_requeues(&self, key: &ObjectKey) -> u32;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ItemExponentialRateLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<ObjectKey, u32>>,
}

impl ItemExponentialRateLimiter {
    /// Creates a limiter starting at `base` and capped at `max`.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter for ItemExponentialRateLimiter {
    fn when(&self, key: &ObjectKey) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(key.clone()).or_insert(0);
        let delay = ExponentialBackoff::for_attempt(*count, self.base, self.max);
        *count = count.saturating_add(1);
        delay
    }

    fn forget(&self, key: &ObjectKey) {
        lock(&self.failures).remove(key);
    }

    fn num_requeues(&self, key: &ObjectKey) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Global token bucket shared by all keys.
///
/// Holds up to `burst` tokens refilled at `qps` per second. Each call to
/// [`when`](RateLimiter::when) reserves one token and returns how long the
/// caller must wait for it. Keeps no per-key state.
#[derive(Debug)]
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    /// Creates a full bucket.
    #[must_use]
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl RateLimiter for BucketRateLimiter {
    fn when(&self, _key: &ObjectKey) -> Duration {
        let mut bucket = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;

        if bucket.tokens >= 0.0 || self.qps <= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-bucket.tokens / self.qps).unwrap_or(Duration::MAX)
        }
    }

    fn forget(&self, _key: &ObjectKey) {}

    fn num_requeues(&self, _key: &ObjectKey) -> u32 {
        0
    }
}

/// Combines limiters by taking the longest delay.
#[derive(Debug)]
pub struct MaxOfRateLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    /// Wraps `limiters`; every one of them sees every call.
    #[must_use]
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, key: &ObjectKey) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(key))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &ObjectKey) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// Per-key backoff from 5ms to 1000s combined with a 10 qps / 100 burst bucket.
#[must_use]
pub fn default_controller_rate_limiter() -> MaxOfRateLimiter {
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}
