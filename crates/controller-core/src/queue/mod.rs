//! Deduplicating work queue with per-key serialization.
//!
//! A key is either pending (in `queue` and `dirty`), in flight (in
//! `processing`), or both when it was re-added while a worker held it. A
//! key in flight is never handed out again until [`WorkQueue::done`] is
//! called for it, so at most one worker processes a given key at a time.

pub mod rate_limiter;

pub use rate_limiter::{
    BucketRateLimiter, ItemExponentialRateLimiter, MaxOfRateLimiter, RateLimiter,
    default_controller_rate_limiter,
};

use crate::key::ObjectKey;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Longest delay honoured by [`WorkQueue::add_after`].
const MAX_DELAY: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Default)]
struct QueueState {
    /// Pending keys in delivery order
    queue: VecDeque<ObjectKey>,
    /// Keys that need processing
    dirty: HashSet<ObjectKey>,
    /// Keys currently held by a worker
    processing: HashSet<ObjectKey>,
    /// Delayed adds and the instant each becomes ready
    waiting: HashMap<ObjectKey, Instant>,
    shutting_down: bool,
}

/// Rate-limited work queue of object keys.
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    /// Wakes workers blocked in `get`
    available: Notify,
    /// Wakes `shut_down_with_drain` when nothing is in flight
    drained: Notify,
    rate_limiter: Box<dyn RateLimiter>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(default_controller_rate_limiter())
    }
}

impl WorkQueue {
    /// Creates an empty queue using `rate_limiter` for requeue delays.
    #[must_use]
    pub fn new(rate_limiter: impl RateLimiter + 'static) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            drained: Notify::new(),
            rate_limiter: Box::new(rate_limiter),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `key` as needing processing.
    ///
    /// No-op if the key is already pending. A key currently in flight is
    /// re-delivered once its worker calls [`done`](Self::done). Ignored after
    /// shutdown.
    pub fn add(&self, key: ObjectKey) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.available.notify_one();
    }

    /// Waits for the next key.
    ///
    /// Returns `None` once shutdown was requested and every pending key has
    /// been handed out. The caller owns the key until it calls
    /// [`done`](Self::done).
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        // Pass the wakeup on if another item is waiting
                        self.available.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Releases `key` after processing.
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.lock();
        state.processing.remove(key);
        let requeue = state.dirty.contains(key);
        if requeue {
            state.queue.push_back(key.clone());
        }
        let idle = state.processing.is_empty();
        drop(state);

        if requeue {
            self.available.notify_one();
        }
        if idle {
            self.drained.notify_waiters();
        }
    }

    /// Adds `key` once `delay` has elapsed.
    ///
    /// A key already waiting for an earlier ready time keeps it. Delays
    /// are capped at thirty years.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let ready_at = Instant::now() + delay.min(MAX_DELAY);
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            if state.waiting.get(&key).is_some_and(|at| *at <= ready_at) {
                return;
            }
            state.waiting.insert(key.clone(), ready_at);
        }

        let queue = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(ready_at).await;
            if let Some(queue) = queue.upgrade() {
                queue.fire_waiting(key, ready_at);
            }
        });
    }

    fn fire_waiting(&self, key: ObjectKey, ready_at: Instant) {
        {
            let mut state = self.lock();
            // Superseded by an earlier add_after for the same key
            if state.waiting.get(&key) != Some(&ready_at) {
                return;
            }
            state.waiting.remove(&key);
        }
        self.add(key);
    }

    /// Re-queues `key` after the delay chosen by the rate limiter.
    pub fn add_rate_limited(self: &Arc<Self>, key: ObjectKey) {
        let delay = self.rate_limiter.when(&key);
        debug!(%key, delay = ?delay, "requeue with rate limit");
        self.add_after(key, delay);
    }

    /// Clears the retry history of `key`.
    pub fn forget(&self, key: &ObjectKey) {
        self.rate_limiter.forget(key);
    }

    /// Rate-limited requeues of `key` since it was last forgotten.
    #[must_use]
    pub fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.rate_limiter.num_requeues(key)
    }

    /// Number of pending keys, not counting keys in flight or waiting on a delay.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no key is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Whether [`shut_down`](Self::shut_down) was called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Stops accepting new keys. Blocked and future `get` calls return
    /// `None` once the pending keys are handed out.
    pub fn shut_down(&self) {
        let mut state = self.lock();
        state.shutting_down = true;
        state.waiting.clear();
        drop(state);
        self.available.notify_waiters();
    }

    /// Shuts down, then waits until every key in flight has been released.
    pub async fn shut_down_with_drain(&self) {
        self.shut_down();
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.lock().processing.is_empty() {
                return;
            }
            notified.await;
        }
    }
}
