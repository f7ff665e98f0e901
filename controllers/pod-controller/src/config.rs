//! Process configuration from environment variables.

use crate::error::ConfigError;
use controller_core::{ControllerConfig, InformerConfig, LeaderElectionConfig};
use std::env;
use std::fs;
use std::str::FromStr;
use std::time::Duration;

/// Namespace file mounted into every pod with a service account token.
const SERVICE_ACCOUNT_NAMESPACE_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

const DEFAULT_LEASE_NAMESPACE: &str = "kube-system";
const DEFAULT_LEASE_NAME: &str = "controller-lock";

/// Runtime configuration of the pod controller.
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace to watch, `None` for all namespaces
    pub watch_namespace: Option<String>,
    /// Namespace holding the leader election lease
    pub lease_namespace: String,
    /// Name of the leader election lease
    pub lease_name: String,
    /// Candidate identity written into the lease
    pub identity: String,
    /// Default log filter directive
    pub log_level: String,
    /// Emit JSON logs
    pub log_json: bool,
    /// Worker task count
    pub workers: usize,
    /// Handler retries before a key is dropped
    pub max_retries: u32,
    /// Full relist interval
    pub resync_period: Duration,
    /// Lease validity without renewal
    pub lease_duration: Duration,
    /// Leader's renewal budget
    pub renew_deadline: Duration,
    /// Interval between election attempts
    pub retry_period: Duration,
}

impl Config {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for malformed variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let service_account_namespace = fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_PATH).ok();
        Self::from_lookup(|name| env::var(name).ok(), service_account_namespace)
    }

    /// Builds the configuration from a variable lookup and the service
    /// account namespace, if one is mounted.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for malformed variables.
    pub fn from_lookup<F>(lookup: F, service_account_namespace: Option<String>) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let lease_namespace = var("CTRL_NAMESPACE")
            .or_else(|| {
                service_account_namespace
                    .map(|ns| ns.trim().to_string())
                    .filter(|ns| !ns.is_empty())
            })
            .unwrap_or_else(|| DEFAULT_LEASE_NAMESPACE.to_string());

        let log_level = match var("CTRL_LOG_LEVEL") {
            None => "info".to_string(),
            Some(level) => match level.to_ascii_lowercase().as_str() {
                level @ ("debug" | "info" | "warn" | "error") => level.to_string(),
                _ => {
                    return Err(ConfigError::InvalidValue {
                        name: "CTRL_LOG_LEVEL",
                        value: level,
                        reason: "expected one of DEBUG, INFO, WARN, ERROR".to_string(),
                    });
                }
            },
        };

        let log_json = match var("CTRL_LOG_JSON") {
            None => true,
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        name: "CTRL_LOG_JSON",
                        value: raw,
                        reason: "expected true or false".to_string(),
                    });
                }
            },
        };

        let identity = match var("POD_NAME") {
            Some(pod) => format!("{pod}_{}", uuid::Uuid::new_v4()),
            None => uuid::Uuid::new_v4().to_string(),
        };

        let workers: usize = parse(&var, "CTRL_WORKERS", 2)?;
        if workers == 0 {
            return Err(ConfigError::InvalidValue {
                name: "CTRL_WORKERS",
                value: "0".to_string(),
                reason: "at least one worker is required".to_string(),
            });
        }

        Ok(Self {
            watch_namespace: var("WATCH_NAMESPACE"),
            lease_namespace,
            lease_name: var("CTRL_LEASE_NAME").unwrap_or_else(|| DEFAULT_LEASE_NAME.to_string()),
            identity,
            log_level,
            log_json,
            workers,
            max_retries: parse(&var, "CTRL_MAX_RETRIES", 3)?,
            resync_period: seconds(&var, "CTRL_RESYNC_SECONDS", 60)?,
            lease_duration: seconds(&var, "CTRL_LEASE_DURATION_SECONDS", 30)?,
            renew_deadline: seconds(&var, "CTRL_RENEW_DEADLINE_SECONDS", 10)?,
            retry_period: seconds(&var, "CTRL_RETRY_PERIOD_SECONDS", 5)?,
        })
    }

    /// Pipeline settings.
    #[must_use]
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            max_retries: self.max_retries,
            informer: InformerConfig {
                resync_period: self.resync_period,
                ..InformerConfig::default()
            },
        }
    }

    /// Election settings.
    #[must_use]
    pub fn leader_election_config(&self) -> LeaderElectionConfig {
        LeaderElectionConfig {
            lease_duration: self.lease_duration,
            renew_deadline: self.renew_deadline,
            retry_period: self.retry_period,
            release_on_cancel: true,
        }
    }
}

fn parse<T, F>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            name,
            reason: e.to_string(),
            value: raw,
        }),
    }
}

fn seconds<F>(var: &F, name: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let secs: u64 = parse(var, name, default)?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            name,
            value: "0".to_string(),
            reason: "must be at least one second".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)], sa_namespace: Option<&str>) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned(), sa_namespace.map(str::to_string))
    }

    #[test]
    fn test_defaults() {
        let config = config(&[], None).unwrap();

        assert_eq!(config.watch_namespace, None);
        assert_eq!(config.lease_namespace, "kube-system");
        assert_eq!(config.lease_name, "controller-lock");
        assert_eq!(config.log_level, "info");
        assert!(config.log_json);
        assert_eq!(config.workers, 2);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.resync_period, Duration::from_secs(60));
        assert!(config.leader_election_config().validate().is_ok());
        assert!(uuid::Uuid::parse_str(&config.identity).is_ok());
    }

    #[test]
    fn test_lease_namespace_resolution() {
        assert_eq!(config(&[], Some("platform\n")).unwrap().lease_namespace, "platform");
        assert_eq!(
            config(&[("CTRL_NAMESPACE", "ops")], Some("platform")).unwrap().lease_namespace,
            "ops"
        );
    }

    #[test]
    fn test_overrides() {
        let config = config(
            &[
                ("WATCH_NAMESPACE", "apps"),
                ("CTRL_LOG_LEVEL", "DEBUG"),
                ("CTRL_LOG_JSON", "false"),
                ("CTRL_WORKERS", "8"),
                ("CTRL_RESYNC_SECONDS", "300"),
                ("POD_NAME", "pod-controller-7d9f"),
            ],
            None,
        )
        .unwrap();

        assert_eq!(config.watch_namespace.as_deref(), Some("apps"));
        assert_eq!(config.log_level, "debug");
        assert!(!config.log_json);
        assert_eq!(config.controller_config().workers, 8);
        assert_eq!(config.controller_config().informer.resync_period, Duration::from_secs(300));
        assert!(config.identity.starts_with("pod-controller-7d9f_"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(matches!(
            config(&[("CTRL_LOG_LEVEL", "verbose")], None),
            Err(ConfigError::InvalidValue { name: "CTRL_LOG_LEVEL", .. })
        ));
        assert!(matches!(
            config(&[("CTRL_WORKERS", "many")], None),
            Err(ConfigError::InvalidValue { name: "CTRL_WORKERS", .. })
        ));
        assert!(matches!(
            config(&[("CTRL_WORKERS", "0")], None),
            Err(ConfigError::InvalidValue { name: "CTRL_WORKERS", .. })
        ));
        assert!(matches!(
            config(&[("CTRL_RETRY_PERIOD_SECONDS", "0")], None),
            Err(ConfigError::InvalidValue { name: "CTRL_RETRY_PERIOD_SECONDS", .. })
        ));
    }
}
