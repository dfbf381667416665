//! Operator settings
//!
//! Settings are read from an optional TOML file and then overridden by
//! command line flags / environment variables in the binary.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const DEFAULT_MIN_REQUEUE_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_MAX_REQUEUE_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_LOCK_POOL_CAPACITY: usize = 20;

/// Settings for the reconciliation core
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperatorSettings {
    /// Operator name, used as field manager for finalizer patches
    pub name: String,
    /// Namespace to watch; `None` watches the whole cluster
    pub namespace: Option<String>,
    /// Retry delay unit: attempt `n` waits `n * min`
    pub min_requeue_interval_ms: u64,
    /// Upper bound of the retry delay
    pub max_requeue_interval_ms: u64,
    /// Number of idle lock primitives kept for reuse
    pub lock_pool_capacity: usize,
    /// Add registered finalizer names to resources before reconciling
    pub auto_attach_finalizers: bool,
    /// Remove finalizer names once their cleanup succeeded
    pub auto_detach_finalizers: bool,
    pub leader_election: LeaderElectionSettings,
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            name: "kubeops-operator".to_string(),
            namespace: None,
            min_requeue_interval_ms: DEFAULT_MIN_REQUEUE_INTERVAL_MS,
            max_requeue_interval_ms: DEFAULT_MAX_REQUEUE_INTERVAL_MS,
            lock_pool_capacity: DEFAULT_LOCK_POOL_CAPACITY,
            auto_attach_finalizers: true,
            auto_detach_finalizers: true,
            leader_election: LeaderElectionSettings::default(),
        }
    }
}

impl OperatorSettings {
    /// Load settings from a TOML file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Self = toml::from_str(&content).map_err(|e| {
            Error::ConfigError(format!("Failed to parse {}: {e}", path.display()))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn min_requeue_interval(&self) -> Duration {
        Duration::from_millis(self.min_requeue_interval_ms)
    }

    pub fn max_requeue_interval(&self) -> Duration {
        Duration::from_millis(self.max_requeue_interval_ms)
    }

    /// Check the invariants the queue and lock provider rely on
    pub fn validate(&self) -> Result<()> {
        if self.min_requeue_interval_ms == 0 {
            return Err(Error::ConfigError(
                "minRequeueIntervalMs must be greater than zero".to_string(),
            ));
        }
        if self.min_requeue_interval_ms > self.max_requeue_interval_ms {
            return Err(Error::ConfigError(format!(
                "minRequeueIntervalMs ({}) must not exceed maxRequeueIntervalMs ({})",
                self.min_requeue_interval_ms, self.max_requeue_interval_ms
            )));
        }
        if self.lock_pool_capacity == 0 {
            return Err(Error::ConfigError(
                "lockPoolCapacity must be a positive integer".to_string(),
            ));
        }
        self.leader_election.validate()
    }
}

/// Lease based leader election timings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeaderElectionSettings {
    /// When disabled the operator is always leader
    pub enabled: bool,
    pub lease_name: String,
    /// Namespace holding the lease; falls back to the pod namespace
    pub lease_namespace: Option<String>,
    pub lease_duration_secs: u64,
    pub renew_interval_secs: u64,
    pub retry_interval_secs: u64,
}

impl Default for LeaderElectionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            lease_name: "kubeops-operator-leader".to_string(),
            lease_namespace: None,
            lease_duration_secs: 15,
            renew_interval_secs: 10,
            retry_interval_secs: 5,
        }
    }
}

impl LeaderElectionSettings {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.renew_interval_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.lease_name.is_empty() {
            return Err(Error::ConfigError(
                "leaderElection.leaseName must not be empty".to_string(),
            ));
        }
        if self.renew_interval_secs == 0 || self.renew_interval_secs >= self.lease_duration_secs
        {
            return Err(Error::ConfigError(format!(
                "leaderElection.renewIntervalSecs ({}) must be between 1 and leaseDurationSecs ({})",
                self.renew_interval_secs, self.lease_duration_secs
            )));
        }
        Ok(())
    }
}
