use crate::error::LeaseError;
use crate::leader::{LeaderElectionRecord, LeaseLock, ObservedLease};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct Slot {
    record: Option<LeaderElectionRecord>,
    version: u64,
    unreachable: bool,
}

/// Lease lock backed by a shared in-memory slot.
///
/// Clones and [`candidate`](Self::candidate) handles all see the same lease;
/// each handle writes its own identity.
#[derive(Debug, Clone)]
pub struct MemoryLeaseLock {
    slot: Arc<Mutex<Slot>>,
    identity: String,
}

impl MemoryLeaseLock {
    /// A fresh lease with no holder, locked as `identity`.
    #[must_use]
    pub fn new(identity: &str) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot::default())),
            identity: identity.to_string(),
        }
    }

    /// Another candidate competing for the same lease.
    #[must_use]
    pub fn candidate(&self, identity: &str) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            identity: identity.to_string(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_reachable(slot: &Slot) -> Result<(), LeaseError> {
        if slot.unreachable {
            return Err(LeaseError::Unavailable("lease backend unreachable".to_string()));
        }
        Ok(())
    }

    /// Makes every call fail with [`LeaseError::Unavailable`] while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Current holder, `None` if the lease is free or missing.
    #[must_use]
    pub fn holder(&self) -> Option<String> {
        self.lock()
            .record
            .as_ref()
            .and_then(|record| record.holder().map(str::to_string))
    }

    /// Stored record.
    #[must_use]
    pub fn record(&self) -> Option<LeaderElectionRecord> {
        self.lock().record.clone()
    }

    /// Overwrites the holder behind every candidate's back.
    pub fn steal(&self, identity: &str) {
        let mut slot = self.lock();
        let now = Utc::now();
        let previous = slot.record.take();
        slot.record = Some(LeaderElectionRecord {
            holder_identity: identity.to_string(),
            lease_duration: previous
                .as_ref()
                .map_or(Duration::from_secs(30), |record| record.lease_duration),
            acquire_time: now,
            renew_time: now,
            leader_transitions: previous.map_or(0, |record| record.leader_transitions + 1),
        });
        slot.version += 1;
    }
}

#[async_trait]
impl LeaseLock for MemoryLeaseLock {
    async fn get(&self) -> Result<Option<ObservedLease>, LeaseError> {
        let slot = self.lock();
        Self::check_reachable(&slot)?;
        Ok(slot.record.clone().map(|record| ObservedLease {
            record,
            resource_version: slot.version.to_string(),
        }))
    }

    async fn create(&self, record: &LeaderElectionRecord) -> Result<String, LeaseError> {
        let mut slot = self.lock();
        Self::check_reachable(&slot)?;
        if slot.record.is_some() {
            return Err(LeaseError::AlreadyExists(self.describe()));
        }
        slot.record = Some(record.clone());
        slot.version += 1;
        Ok(slot.version.to_string())
    }

    async fn update(&self, record: &LeaderElectionRecord, resource_version: &str) -> Result<String, LeaseError> {
        let mut slot = self.lock();
        Self::check_reachable(&slot)?;
        if slot.record.is_none() || slot.version.to_string() != resource_version {
            return Err(LeaseError::Conflict(self.describe()));
        }
        slot.record = Some(record.clone());
        slot.version += 1;
        Ok(slot.version.to_string())
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn describe(&self) -> String {
        "memory/controller-lock".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(holder: &str) -> LeaderElectionRecord {
        let now = Utc::now();
        LeaderElectionRecord {
            holder_identity: holder.to_string(),
            lease_duration: Duration::from_secs(30),
            acquire_time: now,
            renew_time: now,
            leader_transitions: 0,
        }
    }

    #[tokio::test]
    async fn test_updates_are_version_checked() {
        let a = MemoryLeaseLock::new("a");
        let b = a.candidate("b");

        let version = a.create(&record("a")).await.unwrap();
        assert!(matches!(b.create(&record("b")).await, Err(LeaseError::AlreadyExists(_))));

        let next = a.update(&record("a"), &version).await.unwrap();
        assert!(matches!(
            b.update(&record("b"), &version).await,
            Err(LeaseError::Conflict(_))
        ));
        assert_eq!(b.get().await.unwrap().unwrap().resource_version, next);
        assert_eq!(b.holder().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_unreachable_fails_every_call() {
        let lock = MemoryLeaseLock::new("a");
        lock.set_unreachable(true);

        let err = lock.get().await.unwrap_err();
        assert!(!err.is_contention());
        assert!(matches!(err, LeaseError::Unavailable(_)));
    }
}
