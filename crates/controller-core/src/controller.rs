//! Controller pipeline.
//!
//! Wires the informer, router, work queue and worker pool together and
//! runs them inside one cancellation scope:
//!
//! ```text
//! ListerWatcher -> Informer -> Notification channel -> Router -> WorkQueue -> Workers -> Handler
//!                     |                                                          ^
//!                     +------------------------ Store ---------------------------+
//! ```

use crate::cache::{Informer, InformerConfig, ListerWatcher, Notification, Store};
use crate::error::ControllerError;
use crate::queue::WorkQueue;
use crate::router::{Predicate, Router};
use crate::worker::{DEFAULT_MAX_RETRIES, Handler, Worker};
use futures::future::join_all;
use kube::Resource;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info};

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of worker tasks
    pub workers: usize,
    /// Handler retries before a key is dropped
    pub max_retries: u32,
    /// Cache timing
    pub informer: InformerConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_retries: DEFAULT_MAX_RETRIES,
            informer: InformerConfig::default(),
        }
    }
}

/// A watch-driven reconciliation pipeline for one resource type.
pub struct Controller<K, L, H> {
    informer: Informer<K, L>,
    notifications: mpsc::UnboundedReceiver<Notification<K>>,
    queue: Arc<WorkQueue>,
    handler: Arc<H>,
    filter: Option<Predicate<K>>,
    workers: usize,
    max_retries: u32,
}

impl<K, L, H> std::fmt::Debug for Controller<K, L, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("informer", &self.informer)
            .field("queue", &self.queue)
            .field("workers", &self.workers)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl<K, L, H> Controller<K, L, H>
where
    K: Resource + Send + Sync + 'static,
    L: ListerWatcher<K>,
    H: Handler<K>,
{
    /// Builds a controller reading from `source` and reconciling with `handler`.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::InvalidConfig`] when no workers are configured.
    pub fn new(source: L, handler: H, config: ControllerConfig) -> Result<Self, ControllerError> {
        if config.workers == 0 {
            return Err(ControllerError::InvalidConfig(
                "at least one worker is required".to_string(),
            ));
        }
        let (informer, notifications) = Informer::new(source, config.informer);
        Ok(Self {
            informer,
            notifications,
            queue: Arc::new(WorkQueue::default()),
            handler: Arc::new(handler),
            filter: None,
            workers: config.workers,
            max_retries: config.max_retries,
        })
    }

    /// Only reconciles objects for which `filter` returns `true`.
    #[must_use]
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&K) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// The controller's work queue.
    #[must_use]
    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Read handle onto the controller's cache.
    #[must_use]
    pub fn store(&self) -> Store<K> {
        self.informer.store()
    }

    /// Runs the pipeline until `cancel` fires.
    ///
    /// Returns once the watch has stopped, the queue has been shut down and
    /// every worker has finished its last item.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::InitialSync`] if the cache never syncs
    /// (cancellation before the first sync is a clean stop), or
    /// [`ControllerError::TaskFailed`] if a pipeline task dies.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), ControllerError> {
        info!(workers = self.workers, "Starting controller");
        let store = self.informer.store();
        let router = tokio::spawn(
            Router::new(Arc::clone(&self.queue), self.filter.clone())
                .run(self.notifications)
                .in_current_span(),
        );

        let mut informer = match self.informer.start(cancel.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                self.queue.shut_down();
                // The informer is gone, so its channel is closed
                let _ = router.await;
                if cancel.is_cancelled() {
                    info!("Controller cancelled before the cache synced");
                    return Ok(());
                }
                error!(error = %e, "Cache sync failed, controller not started");
                return Err(e);
            }
        };

        let workers = Worker::new(
            Arc::clone(&self.queue),
            store,
            self.handler,
            self.filter,
            self.max_retries,
        )
        .spawn(self.workers);
        info!("Controller running");

        let informer_result = tokio::select! {
            () = cancel.cancelled() => {
                info!("Controller shutting down");
                informer.await
            }
            result = &mut informer => {
                error!("Informer stopped before shutdown was requested");
                result
            }
        };
        let mut failure = match informer_result {
            Ok(()) if cancel.is_cancelled() => None,
            Ok(()) => Some(ControllerError::TaskFailed("informer stopped".to_string())),
            Err(e) => Some(ControllerError::TaskFailed(format!("informer: {e}"))),
        };

        if let Err(e) = router.await {
            failure.get_or_insert(ControllerError::TaskFailed(format!("router: {e}")));
        }

        self.queue.shut_down();
        for result in join_all(workers).await {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
                failure.get_or_insert(ControllerError::TaskFailed(format!("worker: {e}")));
            }
        }

        info!("Controller stopped");
        failure.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::key::ObjectKey;
    use crate::mock::FakeListerWatcher;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{Pod, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;
    use tracing_test::traced_test;

    fn pod(name: &str, ip: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                pod_ip: ip.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn has_ip(pod: &Pod) -> bool {
        pod.status
            .as_ref()
            .and_then(|status| status.pod_ip.as_ref())
            .is_some()
    }

    /// Records calls and fails keys listed in `failing`.
    #[derive(Debug, Default)]
    struct ScriptedHandler {
        failing: HashSet<ObjectKey>,
        updates: Mutex<HashMap<ObjectKey, Vec<Instant>>>,
        deletes: Mutex<Vec<ObjectKey>>,
        in_flight: Mutex<HashSet<ObjectKey>>,
        overlap: Mutex<bool>,
    }

    impl ScriptedHandler {
        fn failing(keys: &[&str]) -> Self {
            Self {
                failing: keys.iter().map(|k| ObjectKey::from(*k)).collect(),
                ..Default::default()
            }
        }

        fn update_times(&self, key: &str) -> Vec<Instant> {
            self.updates
                .lock()
                .unwrap()
                .get(&ObjectKey::from(key))
                .cloned()
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl Handler<Pod> for Arc<ScriptedHandler> {
        async fn add_or_update(&self, key: &ObjectKey, _obj: Arc<Pod>) -> Result<(), HandlerError> {
            if !self.in_flight.lock().unwrap().insert(key.clone()) {
                *self.overlap.lock().unwrap() = true;
            }
            self.updates
                .lock()
                .unwrap()
                .entry(key.clone())
                .or_default()
                .push(Instant::now());
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.lock().unwrap().remove(key);

            if self.failing.contains(key) {
                Err(HandlerError::Reconciliation(format!("{key} is broken")))
            } else {
                Ok(())
            }
        }

        async fn delete(&self, key: &ObjectKey) -> Result<(), HandlerError> {
            self.deletes.lock().unwrap().push(key.clone());
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_pipeline_scenarios() {
        let source = FakeListerWatcher::with_objects(vec![
            pod("pod-a", None),
            pod("pod-b", Some("10.0.0.2")),
            pod("pod-c", Some("10.0.0.3")),
        ]);
        let handler = Arc::new(ScriptedHandler::failing(&["default/pod-c"]));
        let controller = Controller::new(source.clone(), Arc::clone(&handler), ControllerConfig::default())
            .unwrap()
            .with_filter(has_ip);
        let queue = controller.queue();
        let store = controller.store();
        let cancel = CancellationToken::new();
        let run = tokio::spawn(controller.run(cancel.clone()).in_current_span());

        tokio::time::sleep(Duration::from_secs(5)).await;

        // Filtered out: never reaches the handler
        assert!(handler.update_times("default/pod-a").is_empty());

        // Succeeds once, retry history cleared
        assert_eq!(handler.update_times("default/pod-b").len(), 1);
        assert_eq!(queue.num_requeues(&ObjectKey::from("default/pod-b")), 0);

        // Fails on every attempt: initial call plus three retries, then dropped
        let attempts = handler.update_times("default/pod-c");
        assert_eq!(attempts.len(), 4);
        let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps.windows(2).all(|w| w[0] < w[1]), "delays must grow: {gaps:?}");
        assert_eq!(queue.num_requeues(&ObjectKey::from("default/pod-c")), 0);
        logs_assert(|lines: &[&str]| {
            let dropped: Vec<&&str> = lines
                .iter()
                .filter(|line| line.contains("ERROR") && line.contains("permanent failure"))
                .collect();
            match dropped.as_slice() {
                [line] if line.contains("default/pod-c") => Ok(()),
                other => Err(format!("expected one permanent failure for pod-c, got {other:?}")),
            }
        });

        // A processed delete leaves nothing in the cache
        source.delete(&ObjectKey::from("default/pod-b"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*handler.deletes.lock().unwrap(), vec![ObjectKey::from("default/pod-b")]);
        assert!(store.get_by_key(&ObjectKey::from("default/pod-b")).is_none());

        cancel.cancel();
        run.await.unwrap().unwrap();
        assert!(queue.is_shutting_down());
        assert!(!source.is_watched());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_reaches_handler_after_filter_rejects() {
        let source = FakeListerWatcher::with_objects(vec![pod("pod-x", Some("10.0.0.9"))]);
        let handler = Arc::new(ScriptedHandler::default());
        let controller = Controller::new(source.clone(), Arc::clone(&handler), ControllerConfig::default())
            .unwrap()
            .with_filter(has_ip);
        let cancel = CancellationToken::new();
        let run = tokio::spawn(controller.run(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handler.update_times("default/pod-x").len(), 1);

        // Loses its IP, so the filter rejects its last known state
        source.modify(pod("pod-x", None));
        tokio::time::sleep(Duration::from_secs(1)).await;
        source.delete(&ObjectKey::from("default/pod-x"));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(handler.update_times("default/pod-x").len(), 1);
        assert_eq!(*handler.deletes.lock().unwrap(), vec![ObjectKey::from("default/pod-x")]);

        cancel.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_initial_list_fails_startup() {
        let source = FakeListerWatcher::with_objects(vec![pod("pod-b", Some("10.0.0.2"))]);
        source.hang_lists(true);
        let controller = Controller::new(source, Arc::new(ScriptedHandler::default()), ControllerConfig::default())
            .unwrap();
        let queue = controller.queue();

        let result = tokio::time::timeout(Duration::from_secs(60), controller.run(CancellationToken::new()))
            .await
            .expect("startup never gave up on the list");

        assert!(matches!(result, Err(ControllerError::InitialSync(_))));
        assert!(queue.is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_initial_list_stops_cleanly() {
        let source = FakeListerWatcher::with_objects(vec![pod("pod-b", Some("10.0.0.2"))]);
        source.hang_lists(true);
        let handler = Arc::new(ScriptedHandler::default());
        let controller = Controller::new(source, Arc::clone(&handler), ControllerConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        let run = tokio::spawn(controller.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .expect("controller ignored cancellation during the initial list")
            .unwrap()
            .unwrap();
        assert!(handler.update_times("default/pod-b").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_is_never_processed_concurrently() {
        let source = FakeListerWatcher::with_objects(vec![pod("pod-b", Some("10.0.0.2"))]);
        let handler = Arc::new(ScriptedHandler::default());
        let config = ControllerConfig {
            workers: 4,
            ..Default::default()
        };
        let controller = Controller::new(source.clone(), Arc::clone(&handler), config).unwrap();
        let cancel = CancellationToken::new();
        let run = tokio::spawn(controller.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(1)).await;

        for _ in 0..20 {
            source.modify(pod("pod-b", Some("10.0.0.2")));
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!*handler.overlap.lock().unwrap());
        // Updates that arrived while the key was in flight were coalesced
        let calls = handler.update_times("default/pod-b").len();
        assert!(calls > 1 && calls < 21, "unexpected call count {calls}");

        cancel.cancel();
        run.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_sync_failure_stops_the_controller() {
        let source = FakeListerWatcher::with_objects(vec![pod("pod-b", Some("10.0.0.2"))]);
        source.fail_next_lists(u32::MAX);
        let handler = Arc::new(ScriptedHandler::default());
        let controller = Controller::new(source, Arc::clone(&handler), ControllerConfig::default()).unwrap();
        let queue = controller.queue();

        let result = controller.run(CancellationToken::new()).await;

        assert!(matches!(result, Err(ControllerError::InitialSync(_))));
        assert!(queue.is_shutting_down());
        assert!(handler.update_times("default/pod-b").is_empty());
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        let config = ControllerConfig {
            workers: 0,
            ..Default::default()
        };
        let result = Controller::new(
            FakeListerWatcher::<Pod>::new(),
            Arc::new(ScriptedHandler::default()),
            config,
        );
        assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));
    }
}
