//! List + watch + resync loop keeping the [`Store`] current.
//!
//! The informer seeds the store with a full list, then follows the change
//! stream from the list's resource version. Stream failures reconnect with
//! capped exponential backoff; an expired resource version and every resync
//! tick trigger a full relist. Each applied mutation is published as a
//! [`Notification`] on the informer's channel.

use super::source::{ListerWatcher, StreamEvent};
use super::{DeletedObject, Notification, Store, StoreWriter};
use crate::backoff::ExponentialBackoff;
use crate::error::{ControllerError, WatchError};
use crate::key::ObjectKey;
use futures::StreamExt;
use kube::Resource;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

/// Informer timing.
#[derive(Debug, Clone)]
pub struct InformerConfig {
    /// Interval between forced relists
    pub resync_period: Duration,
    /// How long the initial list may keep failing before startup is
    /// abandoned. Also bounds every later relist.
    pub sync_timeout: Duration,
    /// First reconnect delay
    pub min_backoff: Duration,
    /// Reconnect delay cap
    pub max_backoff: Duration,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self {
            resync_period: Duration::from_secs(60),
            sync_timeout: Duration::from_secs(30),
            min_backoff: Duration::from_millis(800),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Mirrors a [`ListerWatcher`] into a [`Store`].
pub struct Informer<K, L> {
    source: L,
    writer: StoreWriter<K>,
    events: mpsc::UnboundedSender<Notification<K>>,
    config: InformerConfig,
}

impl<K, L> Debug for Informer<K, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Informer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<K, L> Informer<K, L>
where
    K: Resource + Send + Sync + 'static,
    L: ListerWatcher<K>,
{
    /// Creates an informer and the receiving end of its notification channel.
    pub fn new(source: L, config: InformerConfig) -> (Self, mpsc::UnboundedReceiver<Notification<K>>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let informer = Self {
            source,
            writer: StoreWriter::new(),
            events,
            config,
        };
        (informer, receiver)
    }

    /// Read handle onto the mirrored collection.
    #[must_use]
    pub fn store(&self) -> Store<K> {
        self.writer.reader()
    }

    /// Performs the initial sync and spawns the watch loop.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::InitialSync`] when the initial list cannot
    /// be completed; no watch is started in that case.
    pub async fn start(mut self, cancel: CancellationToken) -> Result<JoinHandle<()>, ControllerError> {
        let resource_version = self.sync(&cancel).await?;
        Ok(tokio::spawn(self.run(resource_version, cancel).in_current_span()))
    }

    /// Seeds the store with a full list, retrying with backoff until the
    /// sync timeout elapses. Returns the version to start watching from.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::InitialSync`] on timeout or cancellation.
    pub async fn sync(&mut self, cancel: &CancellationToken) -> Result<String, ControllerError> {
        let deadline = Instant::now() + self.config.sync_timeout;
        let mut backoff = ExponentialBackoff::new(self.config.min_backoff, self.config.max_backoff);

        let cancelled = || ControllerError::InitialSync("cancelled before the cache synced".to_string());

        loop {
            let e = match self.relist(deadline, cancel).await {
                Ok(Some(resource_version)) => {
                    self.writer.mark_synced();
                    info!(objects = self.writer.reader().len(), "cache synced");
                    return Ok(resource_version);
                }
                Ok(None) => return Err(cancelled()),
                Err(e) => e,
            };

            let delay = backoff.next_backoff();
            if Instant::now() + delay >= deadline {
                error!(error = %e, "initial list failed, giving up");
                return Err(ControllerError::InitialSync(e.to_string()));
            }
            warn!(error = %e, retry_in = ?delay, "initial list failed");
            if !sleep_or_cancel(delay, cancel).await {
                return Err(cancelled());
            }
        }
    }

    /// Follows the change stream until cancelled.
    pub async fn run(mut self, mut resource_version: String, cancel: CancellationToken) {
        let mut backoff = ExponentialBackoff::new(self.config.min_backoff, self.config.max_backoff);
        let period = self.config.resync_period;
        let mut resync = tokio::time::interval_at(Instant::now() + period, period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'watch: loop {
            let opened = tokio::select! {
                () = cancel.cancelled() => break 'watch,
                opened = self.source.watch(&resource_version) => opened,
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(WatchError::Expired(reason)) => {
                    info!(%reason, "watch version expired, relisting");
                    if !self.resync(&mut resource_version, &mut backoff, &cancel).await {
                        break 'watch;
                    }
                    continue 'watch;
                }
                Err(e) => {
                    let delay = backoff.next_backoff();
                    warn!(error = %e, retry_in = ?delay, "failed to open watch");
                    if !sleep_or_cancel(delay, &cancel).await {
                        break 'watch;
                    }
                    continue 'watch;
                }
            };
            debug!(%resource_version, "watch opened");

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break 'watch,
                    _ = resync.tick() => {
                        debug!("resync period elapsed, relisting");
                        if !self.resync(&mut resource_version, &mut backoff, &cancel).await {
                            break 'watch;
                        }
                        continue 'watch;
                    }
                    next = stream.next() => match next {
                        Some(Ok(event)) => {
                            backoff.reset();
                            if let Some(version) = self.apply(event) {
                                resource_version = version;
                            }
                        }
                        Some(Err(WatchError::Expired(reason))) => {
                            info!(%reason, "watch version expired, relisting");
                            if !self.resync(&mut resource_version, &mut backoff, &cancel).await {
                                break 'watch;
                            }
                            continue 'watch;
                        }
                        Some(Err(e)) => {
                            let delay = backoff.next_backoff();
                            warn!(error = %e, retry_in = ?delay, "watch stream failed, reconnecting");
                            if !sleep_or_cancel(delay, &cancel).await {
                                break 'watch;
                            }
                            continue 'watch;
                        }
                        None => {
                            debug!("watch stream closed, reconnecting");
                            continue 'watch;
                        }
                    }
                }
            }
        }

        info!("informer stopped");
    }

    /// Relists outside the initial sync. Failures are logged and backed off;
    /// returns `false` once cancelled.
    async fn resync(
        &mut self,
        resource_version: &mut String,
        backoff: &mut ExponentialBackoff,
        cancel: &CancellationToken,
    ) -> bool {
        let deadline = Instant::now() + self.config.sync_timeout;
        match self.relist(deadline, cancel).await {
            Ok(Some(version)) => {
                backoff.reset();
                *resource_version = version;
                true
            }
            Ok(None) => false,
            Err(e) => {
                let delay = backoff.next_backoff();
                warn!(error = %e, retry_in = ?delay, "relist failed");
                sleep_or_cancel(delay, cancel).await
            }
        }
    }

    /// Lists the collection, replaces the store content and publishes the
    /// resulting notifications. Returns `Ok(None)` if cancelled first.
    async fn relist(&mut self, deadline: Instant, cancel: &CancellationToken) -> Result<Option<String>, WatchError> {
        let listing = tokio::select! {
            () = cancel.cancelled() => return Ok(None),
            listed = tokio::time::timeout_at(deadline, self.source.list()) => match listed {
                Ok(listing) => listing?,
                Err(_elapsed) => return Err(WatchError::ListTimeout),
            },
        };
        let mut keyed = Vec::with_capacity(listing.items.len());
        let mut unkeyed = Vec::new();

        for obj in listing.items {
            let obj = Arc::new(obj);
            match ObjectKey::for_object(obj.as_ref()) {
                Ok(key) => keyed.push((key, obj)),
                // Not cacheable; the router reports it
                Err(_) => unkeyed.push(obj),
            }
        }

        for notification in self.writer.replace(keyed) {
            self.publish(notification);
        }
        for obj in unkeyed {
            self.publish(Notification::Added(obj));
        }
        debug!(resource_version = %listing.resource_version, "relist applied");
        Ok(Some(listing.resource_version))
    }

    /// Applies one watch event, returning the resource version it carried.
    fn apply(&mut self, event: StreamEvent<K>) -> Option<String> {
        match event {
            StreamEvent::Added(obj) | StreamEvent::Modified(obj) => {
                let version = obj.meta().resource_version.clone();
                let obj = Arc::new(obj);
                let notification = match ObjectKey::for_object(obj.as_ref()) {
                    Ok(key) => match self.writer.insert(key, Arc::clone(&obj)) {
                        Some(old) => Notification::Updated { old, new: obj },
                        None => Notification::Added(obj),
                    },
                    Err(_) => Notification::Added(obj),
                };
                self.publish(notification);
                version
            }
            StreamEvent::Deleted(obj) => {
                let version = obj.meta().resource_version.clone();
                if let Ok(key) = ObjectKey::for_object(&obj) {
                    self.writer.remove(&key);
                }
                self.publish(Notification::Deleted(DeletedObject::Final(Arc::new(obj))));
                version
            }
            StreamEvent::Bookmark(version) => Some(version),
        }
    }

    fn publish(&self, notification: Notification<K>) {
        if self.events.send(notification).is_err() {
            debug!("notification receiver dropped");
        }
    }
}

/// Sleeps for `delay` unless cancelled first. Returns `false` on cancellation.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::FakeListerWatcher;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(namespace: &str, name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn config() -> InformerConfig {
        InformerConfig {
            resync_period: Duration::from_secs(3600),
            sync_timeout: Duration::from_secs(5),
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Notification<Pod>>) -> Notification<Pod> {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("notification channel closed")
    }

    fn name_of(notification: &Notification<Pod>) -> (&'static str, String) {
        match notification {
            Notification::Added(obj) => ("added", obj.metadata.name.clone().unwrap_or_default()),
            Notification::Updated { new, .. } => ("updated", new.metadata.name.clone().unwrap_or_default()),
            Notification::Deleted(deleted) => (
                "deleted",
                deleted.object().metadata.name.clone().unwrap_or_default(),
            ),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_sync_seeds_store() {
        let source = FakeListerWatcher::with_objects(vec![pod("default", "a"), pod("default", "b")]);
        let (mut informer, mut rx) = Informer::new(source, config());
        let store = informer.store();

        assert!(!store.has_synced());
        informer.sync(&CancellationToken::new()).await.unwrap();

        assert!(store.has_synced());
        assert_eq!(store.len(), 2);
        assert!(store.get_by_key(&ObjectKey::from("default/a")).is_some());
        assert_eq!(name_of(&next(&mut rx).await).0, "added");
        assert_eq!(name_of(&next(&mut rx).await).0, "added");
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_sync_failure_is_fatal() {
        let source = FakeListerWatcher::<Pod>::new();
        source.fail_next_lists(u32::MAX);
        let (informer, _rx) = Informer::new(source.clone(), config());
        let store = informer.store();

        let result = informer.start(CancellationToken::new()).await;

        assert!(matches!(result, Err(ControllerError::InitialSync(_))));
        assert!(!store.has_synced());
        assert!(source.list_calls() > 1, "initial list should be retried before giving up");
        assert_eq!(source.watch_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_sync_survives_transient_list_failures() {
        let source = FakeListerWatcher::with_objects(vec![pod("default", "a")]);
        source.fail_next_lists(2);
        let (mut informer, _rx) = Informer::new(source.clone(), config());

        informer.sync(&CancellationToken::new()).await.unwrap();

        assert_eq!(source.list_calls(), 3);
        assert_eq!(informer.store().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_initial_list_times_out() {
        let source = FakeListerWatcher::with_objects(vec![pod("default", "a")]);
        source.hang_lists(true);
        let (informer, _rx) = Informer::new(source.clone(), config());
        let store = informer.store();
        let started = Instant::now();

        let result = informer.start(CancellationToken::new()).await;

        assert!(matches!(result, Err(ControllerError::InitialSync(_))));
        assert!(started.elapsed() <= Duration::from_secs(5));
        assert!(!store.has_synced());
        assert_eq!(source.watch_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_unanswered_initial_list() {
        let source = FakeListerWatcher::<Pod>::new();
        source.hang_lists(true);
        let (mut informer, _rx) = Informer::new(source, config());
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });
        let started = Instant::now();
        let result = informer.sync(&cancel).await;

        assert!(matches!(result, Err(ControllerError::InitialSync(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_unanswered_relist() {
        let source = FakeListerWatcher::with_objects(vec![pod("default", "a")]);
        let (informer, mut rx) = Informer::new(source.clone(), config());
        let cancel = CancellationToken::new();
        let handle = informer.start(cancel.clone()).await.unwrap();
        next(&mut rx).await;

        source.hang_lists(true);
        source.expire();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source.list_calls(), 2);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("informer kept waiting on the relist")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_events_are_applied_and_published() {
        let source = FakeListerWatcher::new();
        let (informer, mut rx) = Informer::new(source.clone(), config());
        let store = informer.store();
        let cancel = CancellationToken::new();
        let handle = informer.start(cancel.clone()).await.unwrap();

        source.add(pod("default", "a"));
        assert_eq!(name_of(&next(&mut rx).await), ("added", "a".to_string()));
        assert!(store.get_by_key(&ObjectKey::from("default/a")).is_some());

        source.modify(pod("default", "a"));
        assert_eq!(name_of(&next(&mut rx).await), ("updated", "a".to_string()));

        source.delete(&ObjectKey::from("default/a"));
        assert_eq!(name_of(&next(&mut rx).await), ("deleted", "a".to_string()));
        assert!(store.get_by_key(&ObjectKey::from("default/a")).is_none());

        cancel.cancel();
        handle.await.unwrap();
        assert!(!source.is_watched());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_watch_triggers_relist() {
        let source = FakeListerWatcher::with_objects(vec![pod("default", "a")]);
        let (informer, mut rx) = Informer::new(source.clone(), config());
        let store = informer.store();
        let cancel = CancellationToken::new();
        let handle = informer.start(cancel.clone()).await.unwrap();
        assert_eq!(name_of(&next(&mut rx).await).0, "added");

        // The delete of "a" is lost with the compacted history
        source.remove_silently(&ObjectKey::from("default/a"));
        source.expire();

        let notification = next(&mut rx).await;
        assert!(matches!(
            notification,
            Notification::Deleted(DeletedObject::Tombstone { ref key, .. }) if key.as_str() == "default/a"
        ));
        assert!(store.is_empty());
        assert_eq!(source.list_calls(), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_heals_missed_delete() {
        let source = FakeListerWatcher::with_objects(vec![pod("default", "a"), pod("default", "b")]);
        let mut config = config();
        config.resync_period = Duration::from_secs(60);
        let (informer, mut rx) = Informer::new(source.clone(), config);
        let store = informer.store();
        let cancel = CancellationToken::new();
        let handle = informer.start(cancel.clone()).await.unwrap();
        next(&mut rx).await;
        next(&mut rx).await;

        source.remove_silently(&ObjectKey::from("default/b"));
        tokio::time::sleep(Duration::from_secs(61)).await;

        let mut seen = vec![name_of(&next(&mut rx).await), name_of(&next(&mut rx).await)];
        seen.sort();
        assert_eq!(seen, vec![("deleted", "b".to_string()), ("updated", "a".to_string())]);
        assert!(store.get_by_key(&ObjectKey::from("default/b")).is_none());
        assert!(store.get_by_key(&ObjectKey::from("default/a")).is_some());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_reconnects_from_last_version() {
        let source = FakeListerWatcher::new();
        let (informer, mut rx) = Informer::new(source.clone(), config());
        let cancel = CancellationToken::new();
        let handle = informer.start(cancel.clone()).await.unwrap();

        source.add(pod("default", "a"));
        next(&mut rx).await;
        source.disconnect();
        source.add(pod("default", "b"));

        assert_eq!(name_of(&next(&mut rx).await), ("added", "b".to_string()));
        assert!(source.watch_calls() >= 2);
        // No relist needed to resume
        assert_eq!(source.list_calls(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
