//! Error types for the controller core.
//!
//! Each stage of the pipeline has its own error type so callers can tell
//! a retryable handler failure from a fatal sync or election failure.

use thiserror::Error;

/// Errors that stop the controller pipeline.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The cache could not be seeded with an initial list
    #[error("Initial cache sync failed: {0}")]
    InitialSync(String),

    /// A pipeline task panicked or was aborted
    #[error("Controller task failed: {0}")]
    TaskFailed(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors produced by a list/watch source.
#[derive(Debug, Error)]
pub enum WatchError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The requested resource version is no longer served (HTTP 410 Gone)
    #[error("Resource version expired: {0}")]
    Expired(String),

    /// The watch stream reported an error event
    #[error("Watch stream failed: {0}")]
    Stream(String),

    /// A list call did not answer before its deadline
    #[error("List did not complete in time")]
    ListTimeout,
}

/// Failure to derive a work queue key from an object.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// The object carries no name
    #[error("object has no metadata.name")]
    MissingName,
}

/// Errors returned by domain handlers.
///
/// Every variant is treated as transient by the worker pool and retried
/// with backoff until the retry budget is spent.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The snapshot could not be converted into the handler's model
    #[error("Invalid object: {0}")]
    InvalidObject(String),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    Reconciliation(String),
}

/// Errors from a lease lock backend.
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The lease changed since it was read
    #[error("Lease {0} was modified concurrently")]
    Conflict(String),

    /// The lease was created by another candidate first
    #[error("Lease {0} already exists")]
    AlreadyExists(String),

    /// Backend could not be reached
    #[error("Lease backend unavailable: {0}")]
    Unavailable(String),

    /// The stored lease cannot be read as a leader record
    #[error("Invalid leader record: {0}")]
    InvalidRecord(String),
}

impl LeaseError {
    /// Whether the error only means another candidate won a race.
    #[must_use]
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::AlreadyExists(_))
    }
}

/// Errors that end a leader election run.
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Invalid timing configuration
    #[error("Invalid leader election config: {0}")]
    InvalidConfig(String),

    /// The lease could not be read or written on first contact
    #[error("Lease unreachable: {0}")]
    Unreachable(#[source] LeaseError),

    /// Renewal did not succeed within the renew deadline
    #[error("Leadership lost: {0}")]
    LeadershipLost(String),

    /// The pipeline run under the lease failed
    #[error("Controller failed: {0}")]
    Controller(#[from] ControllerError),
}
