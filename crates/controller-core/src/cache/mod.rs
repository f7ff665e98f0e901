//! Watch-based cache.
//!
//! The [`Informer`] mirrors a remote collection into a [`Store`] through
//! list + watch + periodic resync and publishes every applied mutation as
//! a [`Notification`] on a channel. The informer is the only writer; any
//! number of tasks read through cloned [`Store`] handles.

pub mod informer;
pub mod source;

pub use informer::{Informer, InformerConfig};
pub use source::{EventStream, KubeListerWatcher, ListerWatcher, Listing, StreamEvent};

use crate::key::ObjectKey;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A mutation applied to the cache.
#[derive(Debug, Clone)]
pub enum Notification<K> {
    /// Object seen for the first time
    Added(Arc<K>),
    /// Object replaced, or re-delivered by a resync
    Updated {
        /// Previously cached state
        old: Arc<K>,
        /// New cached state
        new: Arc<K>,
    },
    /// Object removed from the cache
    Deleted(DeletedObject<K>),
}

/// Payload of a delete notification.
#[derive(Debug, Clone)]
pub enum DeletedObject<K> {
    /// Final state delivered by the watch stream
    Final(Arc<K>),
    /// The object disappeared between two lists and its delete event was
    /// never observed. Carries the key it was cached under and the last
    /// state the cache knew.
    Tombstone {
        /// Key the object was stored under
        key: ObjectKey,
        /// Last cached state
        last_known: Arc<K>,
    },
}

impl<K> DeletedObject<K> {
    /// Last known state of the deleted object.
    #[must_use]
    pub fn object(&self) -> &Arc<K> {
        match self {
            Self::Final(obj) => obj,
            Self::Tombstone { last_known, .. } => last_known,
        }
    }
}

#[derive(Debug)]
struct StoreState<K> {
    objects: HashMap<ObjectKey, Arc<K>>,
    synced: bool,
}

/// Read-only handle onto the cache.
#[derive(Debug)]
pub struct Store<K> {
    state: Arc<RwLock<StoreState<K>>>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<K> Store<K> {
    fn read(&self) -> RwLockReadGuard<'_, StoreState<K>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Latest known snapshot for `key`, `None` if the object does not exist.
    #[must_use]
    pub fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.read().objects.get(key).cloned()
    }

    /// Whether the initial list has been applied.
    #[must_use]
    pub fn has_synced(&self) -> bool {
        self.read().synced
    }

    /// Number of cached objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().objects.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().objects.is_empty()
    }

    /// Keys of all cached objects, in no particular order.
    #[must_use]
    pub fn keys(&self) -> Vec<ObjectKey> {
        self.read().objects.keys().cloned().collect()
    }
}

/// Write side of the cache, owned by the informer.
#[derive(Debug)]
pub(crate) struct StoreWriter<K> {
    state: Arc<RwLock<StoreState<K>>>,
}

impl<K> StoreWriter<K> {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(StoreState {
                objects: HashMap::new(),
                synced: false,
            })),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState<K>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn reader(&self) -> Store<K> {
        Store {
            state: Arc::clone(&self.state),
        }
    }

    /// Stores `obj`, returning the state it replaced.
    pub(crate) fn insert(&self, key: ObjectKey, obj: Arc<K>) -> Option<Arc<K>> {
        self.write().objects.insert(key, obj)
    }

    pub(crate) fn remove(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.write().objects.remove(key)
    }

    pub(crate) fn mark_synced(&self) {
        self.write().synced = true;
    }

    /// Swaps the whole content for a fresh list and returns the
    /// notifications describing the difference.
    pub(crate) fn replace(&self, items: Vec<(ObjectKey, Arc<K>)>) -> Vec<Notification<K>> {
        let mut state = self.write();
        let mut previous = std::mem::take(&mut state.objects);
        let mut notifications = Vec::with_capacity(items.len());

        for (key, obj) in items {
            match previous.remove(&key) {
                Some(old) => notifications.push(Notification::Updated {
                    old,
                    new: Arc::clone(&obj),
                }),
                None => notifications.push(Notification::Added(Arc::clone(&obj))),
            }
            state.objects.insert(key, obj);
        }

        notifications.extend(previous.into_iter().map(|(key, last_known)| {
            Notification::Deleted(DeletedObject::Tombstone { key, last_known })
        }));
        notifications
    }
}
