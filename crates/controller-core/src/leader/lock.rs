//! Lease storage backends.

use crate::error::LeaseError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::time::Duration;

/// Leader state stored in the lease.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaderElectionRecord {
    /// Current holder, empty when the lease was released
    pub holder_identity: String,
    /// How long the holder's claim stays valid without renewal
    pub lease_duration: Duration,
    /// When the current holder acquired the lease
    pub acquire_time: DateTime<Utc>,
    /// Last successful renewal
    pub renew_time: DateTime<Utc>,
    /// Number of holder changes
    pub leader_transitions: i32,
}

impl LeaderElectionRecord {
    /// Holder identity, `None` when the lease is free.
    #[must_use]
    pub fn holder(&self) -> Option<&str> {
        Some(self.holder_identity.as_str()).filter(|holder| !holder.is_empty())
    }
}

/// A record together with the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedLease {
    /// Stored leader state
    pub record: LeaderElectionRecord,
    /// Version to pass to a conditional update
    pub resource_version: String,
}

/// Version-checked storage for a [`LeaderElectionRecord`].
#[async_trait]
pub trait LeaseLock: Send + Sync + 'static {
    /// Reads the current record, `None` if the lease does not exist yet.
    async fn get(&self) -> Result<Option<ObservedLease>, LeaseError>;

    /// Creates the lease and returns its version. Fails with
    /// [`LeaseError::AlreadyExists`] if another candidate created it first.
    async fn create(&self, record: &LeaderElectionRecord) -> Result<String, LeaseError>;

    /// Replaces the record if it is still at `resource_version` and returns
    /// the new version. Fails with [`LeaseError::Conflict`] otherwise.
    async fn update(&self, record: &LeaderElectionRecord, resource_version: &str) -> Result<String, LeaseError>;

    /// Identity this lock writes as holder.
    fn identity(&self) -> &str;

    /// Human-readable lease location for logs.
    fn describe(&self) -> String;
}

/// `coordination.k8s.io/v1` Lease lock.
#[derive(Clone)]
pub struct KubeLeaseLock {
    api: Api<Lease>,
    name: String,
    namespace: String,
    identity: String,
}

impl std::fmt::Debug for KubeLeaseLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeLeaseLock")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl KubeLeaseLock {
    /// Lock on the Lease `namespace/name`, writing `identity` as holder.
    #[must_use]
    pub fn new(client: Client, namespace: &str, name: &str, identity: impl Into<String>) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.into(),
        }
    }

    fn lease(&self, record: &LeaderElectionRecord, resource_version: Option<&str>) -> Result<Lease, LeaseError> {
        lease_from_record(&self.name, &self.namespace, record, resource_version)
    }
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    async fn get(&self) -> Result<Option<ObservedLease>, LeaseError> {
        let Some(lease) = self.api.get_opt(&self.name).await? else {
            return Ok(None);
        };
        let resource_version = lease.metadata.resource_version.clone().unwrap_or_default();
        Ok(Some(ObservedLease {
            record: record_from_lease(&lease)?,
            resource_version,
        }))
    }

    async fn create(&self, record: &LeaderElectionRecord) -> Result<String, LeaseError> {
        let lease = self.lease(record, None)?;
        let created = self
            .api
            .create(&PostParams::default(), &lease)
            .await
            .map_err(|e| match e {
                kube::Error::Api(status) if status.code == 409 => LeaseError::AlreadyExists(self.describe()),
                other => LeaseError::Kube(other),
            })?;
        Ok(created.metadata.resource_version.unwrap_or_default())
    }

    async fn update(&self, record: &LeaderElectionRecord, resource_version: &str) -> Result<String, LeaseError> {
        let lease = self.lease(record, Some(resource_version))?;
        let replaced = self
            .api
            .replace(&self.name, &PostParams::default(), &lease)
            .await
            .map_err(|e| match e {
                kube::Error::Api(status) if status.code == 409 => LeaseError::Conflict(self.describe()),
                other => LeaseError::Kube(other),
            })?;
        Ok(replaced.metadata.resource_version.unwrap_or_default())
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Builds the Lease object carrying `record`.
pub(crate) fn lease_from_record(
    name: &str,
    namespace: &str,
    record: &LeaderElectionRecord,
    resource_version: Option<&str>,
) -> Result<Lease, LeaseError> {
    let lease_duration_seconds = i32::try_from(record.lease_duration.as_secs()).map_err(|_overflow| {
        LeaseError::InvalidRecord(format!("lease duration {:?} does not fit in a Lease", record.lease_duration))
    })?;

    Ok(Lease {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            resource_version: resource_version.map(str::to_string),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(record.holder_identity.clone()),
            lease_duration_seconds: Some(lease_duration_seconds),
            acquire_time: Some(MicroTime(record.acquire_time)),
            renew_time: Some(MicroTime(record.renew_time)),
            lease_transitions: Some(record.leader_transitions),
            ..Default::default()
        }),
    })
}

/// Reads the leader record out of a Lease. Missing fields read as a free
/// lease; negative counters are rejected.
pub(crate) fn record_from_lease(lease: &Lease) -> Result<LeaderElectionRecord, LeaseError> {
    let Some(spec) = lease.spec.as_ref() else {
        return Ok(LeaderElectionRecord::default());
    };

    let duration_seconds = spec.lease_duration_seconds.unwrap_or_default();
    let duration_seconds = u64::try_from(duration_seconds)
        .map_err(|_negative| LeaseError::InvalidRecord(format!("negative leaseDurationSeconds {duration_seconds}")))?;
    let leader_transitions = spec.lease_transitions.unwrap_or_default();
    if leader_transitions < 0 {
        return Err(LeaseError::InvalidRecord(format!(
            "negative leaseTransitions {leader_transitions}"
        )));
    }

    Ok(LeaderElectionRecord {
        holder_identity: spec.holder_identity.clone().unwrap_or_default(),
        lease_duration: Duration::from_secs(duration_seconds),
        acquire_time: spec.acquire_time.as_ref().map(|time| time.0).unwrap_or_default(),
        renew_time: spec.renew_time.as_ref().map(|time| time.0).unwrap_or_default(),
        leader_transitions,
    })
}
