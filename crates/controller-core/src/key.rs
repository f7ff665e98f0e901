//! Work item identity.

use crate::error::KeyError;
use kube::Resource;
use std::fmt;

/// Stable identity of a resource instance.
///
/// Namespaced objects are keyed `namespace/name`, cluster-scoped objects
/// by `name` alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Builds a key from its parts.
    #[must_use]
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{ns}/{name}")),
            _ => Self(name.to_string()),
        }
    }

    /// Derives the key of an object from its metadata.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::MissingName`] when `metadata.name` is unset or empty.
    pub fn for_object<K: Resource>(obj: &K) -> Result<Self, KeyError> {
        let meta = obj.meta();
        let name = meta
            .name
            .as_deref()
            .filter(|name| !name.is_empty())
            .ok_or(KeyError::MissingName)?;
        Ok(Self::new(meta.namespace.as_deref(), name))
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Namespace part, `None` for cluster-scoped keys.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.0.split_once('/').map(|(ns, _)| ns)
    }

    /// Name part.
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.split_once('/').map_or(self.0.as_str(), |(_, name)| name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for ObjectKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Namespace, Pod};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(namespace: Option<&str>, name: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: name.map(str::to_string),
                namespace: namespace.map(str::to_string),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_namespaced_key() {
        let key = ObjectKey::for_object(&pod(Some("default"), Some("pod-a"))).unwrap();
        assert_eq!(key.as_str(), "default/pod-a");
        assert_eq!(key.namespace(), Some("default"));
        assert_eq!(key.name(), "pod-a");
    }

    #[test]
    fn test_cluster_scoped_key() {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some("kube-system".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let key = ObjectKey::for_object(&ns).unwrap();
        assert_eq!(key.as_str(), "kube-system");
        assert_eq!(key.namespace(), None);
        assert_eq!(key.name(), "kube-system");
    }

    #[test]
    fn test_missing_name_is_rejected() {
        assert_eq!(
            ObjectKey::for_object(&pod(Some("default"), None)),
            Err(KeyError::MissingName)
        );
        assert_eq!(
            ObjectKey::for_object(&pod(Some("default"), Some(""))),
            Err(KeyError::MissingName)
        );
    }
}
