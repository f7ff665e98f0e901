use crate::cache::{EventStream, ListerWatcher, Listing, StreamEvent};
use crate::error::WatchError;
use crate::key::ObjectKey;
use futures::channel::mpsc;
use futures::{StreamExt, stream};
use kube::Resource;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Sender<K> = mpsc::UnboundedSender<Result<StreamEvent<K>, WatchError>>;

#[derive(Debug)]
struct FakeState<K> {
    objects: BTreeMap<ObjectKey, K>,
    version: u64,
    /// Every recorded event with the version it produced
    history: Vec<(u64, StreamEvent<K>)>,
    /// Watches starting below this version fail as expired
    compacted: u64,
    watchers: Vec<Sender<K>>,
    failing_lists: u32,
    hanging_lists: bool,
    list_calls: usize,
    watch_calls: usize,
}

/// Scripted list/watch source.
///
/// Every mutation bumps a version counter, stamps it into the object's
/// `resourceVersion` and is delivered to open watches and replayed to
/// watches opened later from an older version.
#[derive(Debug)]
pub struct FakeListerWatcher<K> {
    state: Arc<Mutex<FakeState<K>>>,
}

impl<K> Clone for FakeListerWatcher<K> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<K> Default for FakeListerWatcher<K> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                objects: BTreeMap::new(),
                version: 1,
                history: Vec::new(),
                compacted: 0,
                watchers: Vec::new(),
                failing_lists: 0,
                hanging_lists: false,
                list_calls: 0,
                watch_calls: 0,
            })),
        }
    }
}

impl<K> FakeListerWatcher<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// Empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Collection that already holds `objects` before anyone lists it.
    /// Objects without a name are skipped.
    #[must_use]
    pub fn with_objects(objects: Vec<K>) -> Self {
        let fake = Self::new();
        {
            let mut state = fake.lock();
            for obj in objects {
                let obj = Self::stamp(&mut state, obj);
                if let Ok(key) = ObjectKey::for_object(&obj) {
                    state.objects.insert(key, obj);
                }
            }
        }
        fake
    }

    fn lock(&self) -> MutexGuard<'_, FakeState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(state: &mut FakeState<K>, event: StreamEvent<K>) {
        state.history.push((state.version, event.clone()));
        state
            .watchers
            .retain(|watcher| watcher.unbounded_send(Ok(event.clone())).is_ok());
    }

    fn stamp(state: &mut FakeState<K>, mut obj: K) -> K {
        state.version += 1;
        obj.meta_mut().resource_version = Some(state.version.to_string());
        obj
    }

    /// Creates an object and emits `Added`. Objects without a name are
    /// emitted but not stored.
    pub fn add(&self, obj: K) {
        let mut state = self.lock();
        let obj = Self::stamp(&mut state, obj);
        if let Ok(key) = ObjectKey::for_object(&obj) {
            state.objects.insert(key, obj.clone());
        }
        Self::record(&mut state, StreamEvent::Added(obj));
    }

    /// Replaces an object and emits `Modified`.
    pub fn modify(&self, obj: K) {
        let mut state = self.lock();
        let obj = Self::stamp(&mut state, obj);
        if let Ok(key) = ObjectKey::for_object(&obj) {
            state.objects.insert(key, obj.clone());
        }
        Self::record(&mut state, StreamEvent::Modified(obj));
    }

    /// Deletes an object and emits `Deleted` with its final state.
    pub fn delete(&self, key: &ObjectKey) {
        let mut state = self.lock();
        if let Some(obj) = state.objects.remove(key) {
            let obj = Self::stamp(&mut state, obj);
            Self::record(&mut state, StreamEvent::Deleted(obj));
        }
    }

    /// Deletes an object without emitting anything, as if the event was lost.
    pub fn remove_silently(&self, key: &ObjectKey) {
        let mut state = self.lock();
        if state.objects.remove(key).is_some() {
            state.version += 1;
        }
    }

    /// Makes the next `count` list calls fail.
    pub fn fail_next_lists(&self, count: u32) {
        self.lock().failing_lists = count;
    }

    /// While set, list calls never answer.
    pub fn hang_lists(&self, hang: bool) {
        self.lock().hanging_lists = hang;
    }

    /// Compacts history: open watches fail with an expired version and
    /// watches from any older version are refused until the next list.
    pub fn expire(&self) {
        let mut state = self.lock();
        state.compacted = state.version;
        state.history.clear();
        for watcher in state.watchers.drain(..) {
            let _ = watcher.unbounded_send(Err(WatchError::Expired("too old resource version".to_string())));
        }
    }

    /// Ends every open watch stream.
    pub fn disconnect(&self) {
        self.lock().watchers.clear();
    }

    /// Number of list calls so far.
    #[must_use]
    pub fn list_calls(&self) -> usize {
        self.lock().list_calls
    }

    /// Number of watch calls so far.
    #[must_use]
    pub fn watch_calls(&self) -> usize {
        self.lock().watch_calls
    }

    /// Whether some consumer still holds an open watch stream.
    #[must_use]
    pub fn is_watched(&self) -> bool {
        self.lock().watchers.iter().any(|watcher| !watcher.is_closed())
    }
}

#[async_trait::async_trait]
impl<K> ListerWatcher<K> for FakeListerWatcher<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn list(&self) -> Result<Listing<K>, WatchError> {
        let hang = {
            let mut state = self.lock();
            state.list_calls += 1;
            state.hanging_lists
        };
        if hang {
            return std::future::pending().await;
        }

        let mut state = self.lock();
        if state.failing_lists > 0 {
            state.failing_lists -= 1;
            return Err(WatchError::Stream("list failed: injected failure".to_string()));
        }
        Ok(Listing {
            items: state.objects.values().cloned().collect(),
            resource_version: state.version.to_string(),
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<EventStream<K>, WatchError> {
        let mut state = self.lock();
        state.watch_calls += 1;
        let from: u64 = resource_version.parse().unwrap_or(0);
        if from < state.compacted {
            return Err(WatchError::Expired(format!(
                "resource version {from} is older than {}",
                state.compacted
            )));
        }

        let replay: Vec<_> = state
            .history
            .iter()
            .filter(|(version, _)| *version > from)
            .map(|(_, event)| Ok(event.clone()))
            .collect();
        let (tx, rx) = mpsc::unbounded();
        state.watchers.push(tx);
        Ok(stream::iter(replay).chain(rx).boxed())
    }
}
