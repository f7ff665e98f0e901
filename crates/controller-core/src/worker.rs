//! Worker pool draining the work queue into a domain [`Handler`].

use crate::cache::Store;
use crate::error::HandlerError;
use crate::key::ObjectKey;
use crate::queue::WorkQueue;
use crate::router::Predicate;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, warn};

/// Handled items that fail are retried this many times before being dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Domain logic run for each key.
///
/// Both operations must be idempotent: a key may be handed to the handler
/// again with the same snapshot, and `delete` may be called for a key that
/// was never seen or already deleted.
#[async_trait]
pub trait Handler<K>: Send + Sync + 'static {
    /// The object exists; `obj` is its latest cached state.
    async fn add_or_update(&self, key: &ObjectKey, obj: Arc<K>) -> Result<(), HandlerError>;

    /// The object no longer exists.
    async fn delete(&self, key: &ObjectKey) -> Result<(), HandlerError>;
}

/// Releases the dequeued key on every exit path.
struct InFlight<'a> {
    queue: &'a WorkQueue,
    key: ObjectKey,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.queue.done(&self.key);
    }
}

/// One worker loop. Cloned once per spawned task.
pub struct Worker<K, H> {
    queue: Arc<WorkQueue>,
    store: Store<K>,
    handler: Arc<H>,
    filter: Option<Predicate<K>>,
    max_retries: u32,
}

impl<K, H> Clone for Worker<K, H> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            store: self.store.clone(),
            handler: Arc::clone(&self.handler),
            filter: self.filter.clone(),
            max_retries: self.max_retries,
        }
    }
}

impl<K, H> std::fmt::Debug for Worker<K, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl<K, H> Worker<K, H>
where
    K: Send + Sync + 'static,
    H: Handler<K>,
{
    /// Creates a worker reading snapshots from `store`.
    #[must_use]
    pub fn new(
        queue: Arc<WorkQueue>,
        store: Store<K>,
        handler: Arc<H>,
        filter: Option<Predicate<K>>,
        max_retries: u32,
    ) -> Self {
        Self {
            queue,
            store,
            handler,
            filter,
            max_retries,
        }
    }

    /// Spawns `count` workers.
    pub fn spawn(self, count: usize) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|id| {
                let worker = self.clone();
                tokio::spawn(async move { worker.run(id).await }.in_current_span())
            })
            .collect()
    }

    /// Processes keys until the queue shuts down.
    pub async fn run(self, id: usize) {
        debug!(worker = id, "worker started");
        while let Some(key) = self.queue.get().await {
            let item = InFlight {
                queue: &self.queue,
                key,
            };
            let result = self.process_item(&item.key).await;
            self.handle_result(&item.key, result);
        }
        debug!(worker = id, "worker stopped");
    }

    /// Reconciles one key against the current cache state.
    ///
    /// # Errors
    ///
    /// Returns the handler's error; rejected and absent objects are not errors.
    pub async fn process_item(&self, key: &ObjectKey) -> Result<(), HandlerError> {
        match self.store.get_by_key(key) {
            None => {
                debug!(%key, "object gone, handling delete");
                self.handler.delete(key).await
            }
            Some(obj) => {
                if self.filter.as_ref().is_some_and(|filter| !filter(obj.as_ref())) {
                    debug!(%key, "object filtered out, skipping");
                    return Ok(());
                }
                self.handler.add_or_update(key, obj).await
            }
        }
    }

    fn handle_result(&self, key: &ObjectKey, result: Result<(), HandlerError>) {
        match result {
            Ok(()) => self.queue.forget(key),
            Err(e) => {
                let requeues = self.queue.num_requeues(key);
                if requeues < self.max_retries {
                    warn!(%key, error = %e, attempt = requeues + 1, "handler failed, retrying");
                    self.queue.add_rate_limited(key.clone());
                } else {
                    error!(%key, error = %e, retries = requeues, "permanent failure, dropping key");
                    self.queue.forget(key);
                }
            }
        }
    }
}
