//! List/watch sources feeding the informer.
//!
//! [`ListerWatcher`] abstracts the remote collection so the informer can be
//! exercised against an in-memory source in tests. [`KubeListerWatcher`]
//! is the production implementation on top of `kube::Api`.

use crate::error::WatchError;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::Resource;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

/// Server-side timeout for a single watch request, in seconds.
/// Kept below the API server's 5 minute cap so the stream ends cleanly.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Result of a full list.
#[derive(Debug, Clone)]
pub struct Listing<K> {
    /// Every object in the collection
    pub items: Vec<K>,
    /// Version marker to start watching from
    pub resource_version: String,
}

/// One change delivered by a watch stream.
#[derive(Debug, Clone)]
pub enum StreamEvent<K> {
    /// Object created
    Added(K),
    /// Object changed
    Modified(K),
    /// Object deleted, carrying its final state
    Deleted(K),
    /// Progress marker with no object change
    Bookmark(String),
}

/// Stream of watch events.
pub type EventStream<K> = BoxStream<'static, Result<StreamEvent<K>, WatchError>>;

/// A remote collection that can be listed and watched.
#[async_trait::async_trait]
pub trait ListerWatcher<K>: Send + Sync + 'static {
    /// Lists the whole collection.
    async fn list(&self) -> Result<Listing<K>, WatchError>;

    /// Opens a change stream starting after `resource_version`.
    ///
    /// Fails with [`WatchError::Expired`] when the version is too old to
    /// resume from; the informer answers that with a full relist.
    async fn watch(&self, resource_version: &str) -> Result<EventStream<K>, WatchError>;
}

/// List/watch over a Kubernetes collection, namespaced or cluster-wide
/// depending on how the `Api` was built.
pub struct KubeListerWatcher<K> {
    api: Api<K>,
    list_params: ListParams,
    watch_params: WatchParams,
}

impl<K> Debug for KubeListerWatcher<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeListerWatcher")
            .field("list_params", &self.list_params)
            .field("watch_params", &self.watch_params)
            .finish_non_exhaustive()
    }
}

impl<K> KubeListerWatcher<K> {
    /// Watches everything the `Api` can see.
    #[must_use]
    pub fn new(api: Api<K>) -> Self {
        Self {
            api,
            list_params: ListParams::default(),
            watch_params: WatchParams::default().timeout(WATCH_TIMEOUT_SECS),
        }
    }

    /// Restricts the collection with a label selector.
    #[must_use]
    pub fn labels(mut self, selector: &str) -> Self {
        self.list_params = self.list_params.labels(selector);
        self.watch_params = self.watch_params.labels(selector);
        self
    }

    /// Restricts the collection with a field selector.
    #[must_use]
    pub fn fields(mut self, selector: &str) -> Self {
        self.list_params = self.list_params.fields(selector);
        self.watch_params = self.watch_params.fields(selector);
        self
    }
}

#[async_trait::async_trait]
impl<K> ListerWatcher<K> for KubeListerWatcher<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn list(&self) -> Result<Listing<K>, WatchError> {
        let list = self.api.list(&self.list_params).await?;
        Ok(Listing {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }

    async fn watch(&self, resource_version: &str) -> Result<EventStream<K>, WatchError> {
        let stream = self
            .api
            .watch(&self.watch_params, resource_version)
            .await
            .map_err(|e| match e {
                kube::Error::Api(status) if status.code == 410 => WatchError::Expired(status.message),
                other => WatchError::Kube(other),
            })?;
        Ok(stream
            .map(|event| match event {
                Ok(WatchEvent::Added(obj)) => Ok(StreamEvent::Added(obj)),
                Ok(WatchEvent::Modified(obj)) => Ok(StreamEvent::Modified(obj)),
                Ok(WatchEvent::Deleted(obj)) => Ok(StreamEvent::Deleted(obj)),
                Ok(WatchEvent::Bookmark(bookmark)) => {
                    Ok(StreamEvent::Bookmark(bookmark.metadata.resource_version))
                }
                Ok(WatchEvent::Error(status)) if status.code == 410 => {
                    Err(WatchError::Expired(status.message))
                }
                Ok(WatchEvent::Error(status)) => Err(WatchError::Stream(format!(
                    "{} (code {})",
                    status.message, status.code
                ))),
                Err(e) => Err(WatchError::Kube(e)),
            })
            .boxed())
    }
}
