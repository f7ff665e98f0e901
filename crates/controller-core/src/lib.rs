//! Kubernetes Controller Core
//!
//! Building blocks for watch-driven, leader-elected Kubernetes controllers:
//! a list/watch cache, an event router, a deduplicating rate-limited work
//! queue, a worker pool and lease-based leader election.
//!
//! # Example
//!
//! ```no_run
//! use controller_core::{
//!     Controller, ControllerConfig, Handler, HandlerError, KubeLeaseLock, KubeListerWatcher,
//!     LeaderElectionConfig, LeaderElector, ObjectKey,
//! };
//! use k8s_openapi::api::core::v1::Pod;
//! use kube::{Api, Client};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! struct LogHandler;
//!
//! #[async_trait::async_trait]
//! impl Handler<Pod> for LogHandler {
//!     async fn add_or_update(&self, key: &ObjectKey, _pod: Arc<Pod>) -> Result<(), HandlerError> {
//!         println!("sync {key}");
//!         Ok(())
//!     }
//!
//!     async fn delete(&self, key: &ObjectKey) -> Result<(), HandlerError> {
//!         println!("gone {key}");
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::try_default().await?;
//! let source = KubeListerWatcher::new(Api::<Pod>::all(client.clone()));
//! let controller = Controller::new(source, LogHandler, ControllerConfig::default())?;
//!
//! let lock = KubeLeaseLock::new(client, "kube-system", "controller-lock", "controller-0");
//! let elector = LeaderElector::new(lock, LeaderElectionConfig::default())?;
//! elector
//!     .run(CancellationToken::new(), move |scope| controller.run(scope))
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Guarantees
//!
//! - **Per-key serialization**: a key is never processed by two workers at once
//! - **Coalescing**: repeated changes to a pending key collapse into one work item
//! - **Latest wins**: workers read the newest cached state, not the event payload
//! - **Bounded retries**: failed keys back off exponentially and are dropped
//!   after the configured number of retries

pub mod backoff;
pub mod cache;
pub mod controller;
pub mod error;
pub mod key;
pub mod leader;
pub mod queue;
pub mod router;
pub mod worker;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use cache::{
    DeletedObject, Informer, InformerConfig, KubeListerWatcher, ListerWatcher, Notification, Store,
};
pub use controller::{Controller, ControllerConfig};
pub use error::{ControllerError, HandlerError, KeyError, LeaderElectionError, LeaseError, WatchError};
pub use key::ObjectKey;
pub use leader::{KubeLeaseLock, LeaderElectionConfig, LeaderElectionRecord, LeaderElector, LeaseLock};
pub use queue::{RateLimiter, WorkQueue};
pub use router::{Predicate, Router};
pub use worker::{DEFAULT_MAX_RETRIES, Handler, Worker};
#[cfg(any(test, feature = "test-util"))]
pub use mock::{FakeListerWatcher, MemoryLeaseLock};
