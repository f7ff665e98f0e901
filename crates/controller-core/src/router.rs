//! Turns cache notifications into work queue keys.

use crate::cache::{DeletedObject, Notification};
use crate::key::ObjectKey;
use crate::queue::WorkQueue;
use kube::Resource;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Event filter. Objects for which it returns `false` are not reconciled.
pub type Predicate<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;

/// Routes notifications to the work queue.
pub struct Router<K> {
    queue: Arc<WorkQueue>,
    filter: Option<Predicate<K>>,
}

impl<K> std::fmt::Debug for Router<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("queue", &self.queue)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

impl<K: Resource> Router<K> {
    /// Creates a router feeding `queue`.
    #[must_use]
    pub fn new(queue: Arc<WorkQueue>, filter: Option<Predicate<K>>) -> Self {
        Self { queue, filter }
    }

    /// Enqueues the key of one notification.
    ///
    /// Deletions bypass the filter so handlers can always release per-key
    /// state. Returns the key when it was enqueued, `None` when the object
    /// was filtered out or carried no usable identity.
    pub fn route(&self, notification: &Notification<K>) -> Option<ObjectKey> {
        let (obj, known_key, event) = match notification {
            Notification::Added(obj) => (obj, None, "added"),
            Notification::Updated { new, .. } => (new, None, "updated"),
            Notification::Deleted(DeletedObject::Final(obj)) => (obj, None, "deleted"),
            Notification::Deleted(DeletedObject::Tombstone { key, last_known }) => {
                (last_known, Some(key), "deleted")
            }
        };
        let deleted = matches!(notification, Notification::Deleted(_));

        let key = match known_key {
            Some(key) => key.clone(),
            None => match ObjectKey::for_object(obj.as_ref()) {
                Ok(key) => key,
                Err(e) => {
                    error!(event, error = %e, "dropping event: cannot derive key");
                    return None;
                }
            },
        };

        if !deleted && self.filter.as_ref().is_some_and(|filter| !filter(obj.as_ref())) {
            debug!(%key, event, "event filtered out");
            return None;
        }

        debug!(%key, event, "enqueue");
        self.queue.add(key.clone());
        Some(key)
    }

    /// Routes notifications until the channel closes.
    pub async fn run(self, mut notifications: mpsc::UnboundedReceiver<Notification<K>>) {
        while let Some(notification) = notifications.recv().await {
            self.route(&notification);
        }
        debug!("notification channel closed, router stopped");
    }
}
