//! Pod reconciliation.
//!
//! Tracks the last seen state of every pod that has been assigned an IP and
//! logs phase and address changes. Deleting a pod releases its entry.

use async_trait::async_trait;
use controller_core::{Handler, HandlerError, ObjectKey};
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Typed view of the pod fields this controller cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSnapshot {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// Lifecycle phase, `Unknown` when not reported
    pub phase: String,
    /// Primary pod IP
    pub ip: IpAddr,
    /// Node the pod is scheduled on
    pub node: Option<String>,
}

impl TryFrom<&Pod> for PodSnapshot {
    type Error = HandlerError;

    fn try_from(pod: &Pod) -> Result<Self, Self::Error> {
        let name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| HandlerError::InvalidObject("pod has no name".to_string()))?;
        let status = pod.status.as_ref();
        let raw_ip = status
            .and_then(|status| status.pod_ip.as_deref())
            .ok_or_else(|| HandlerError::InvalidObject(format!("pod {name} has no IP")))?;
        let ip = raw_ip
            .parse()
            .map_err(|e| HandlerError::InvalidObject(format!("pod {name} has invalid IP {raw_ip:?}: {e}")))?;

        Ok(Self {
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            phase: status
                .and_then(|status| status.phase.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
            node: pod.spec.as_ref().and_then(|spec| spec.node_name.clone()),
            ip,
            name,
        })
    }
}

/// Only pods with an assigned IP are reconciled.
#[must_use]
pub fn has_pod_ip(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.pod_ip.as_deref())
        .is_some_and(|ip| !ip.is_empty())
}

/// Handler keeping one [`PodSnapshot`] per tracked pod.
#[derive(Debug, Default)]
pub struct PodHandler {
    tracked: Mutex<HashMap<ObjectKey, PodSnapshot>>,
}

impl PodHandler {
    /// Creates a handler tracking nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tracked(&self) -> MutexGuard<'_, HashMap<ObjectKey, PodSnapshot>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn snapshot(&self, key: &ObjectKey) -> Option<PodSnapshot> {
        self.tracked().get(key).cloned()
    }
}

#[async_trait]
impl Handler<Pod> for PodHandler {
    async fn add_or_update(&self, key: &ObjectKey, pod: Arc<Pod>) -> Result<(), HandlerError> {
        let snapshot = PodSnapshot::try_from(pod.as_ref())?;
        let (previous, tracked) = {
            let mut pods = self.tracked();
            let previous = pods.insert(key.clone(), snapshot.clone());
            (previous, pods.len())
        };

        match previous {
            Some(previous) if previous == snapshot => {
                debug!(%key, "Pod unchanged");
            }
            Some(previous) => {
                info!(
                    %key,
                    phase = %snapshot.phase,
                    ip = %snapshot.ip,
                    previous_phase = %previous.phase,
                    node = snapshot.node.as_deref().unwrap_or("-"),
                    tracked,
                    "Pod updated"
                );
            }
            None => {
                info!(
                    %key,
                    phase = %snapshot.phase,
                    ip = %snapshot.ip,
                    node = snapshot.node.as_deref().unwrap_or("-"),
                    tracked,
                    "Pod added"
                );
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), HandlerError> {
        match self.tracked().remove(key) {
            Some(snapshot) => info!(%key, ip = %snapshot.ip, "Pod deleted, state released"),
            None => debug!(%key, "Pod deleted, nothing tracked"),
        }
        Ok(())
    }
}
