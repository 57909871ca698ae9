//! Supervisor configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use jobmesh_worker::WorkerConfig;

use crate::restart::RestartPolicy;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    #[error("invalid supervisor config: {0}")]
    InvalidConfig(String),
}

/// Supervisor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Period of the reconcile pass.
    pub monitor_interval: Duration,
    /// Grace period past `lease_expiry` before the reconcile pass resets a lease.
    pub global_lease_timeout: Duration,
    /// Registrations silent for longer than this are deleted.
    pub worker_stale_after: Duration,
    pub restart: RestartPolicy,
    /// Template for every role's runtime; role, scope and concurrency come
    /// from the role spec.
    pub worker_defaults: WorkerConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            monitor_interval: Duration::from_secs(5 * 60),
            global_lease_timeout: Duration::from_secs(5 * 60),
            worker_stale_after: Duration::from_secs(15 * 60),
            restart: RestartPolicy::default(),
            worker_defaults: WorkerConfig::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_global_lease_timeout(mut self, timeout: Duration) -> Self {
        self.global_lease_timeout = timeout;
        self
    }

    pub fn with_worker_stale_after(mut self, stale_after: Duration) -> Self {
        self.worker_stale_after = stale_after;
        self
    }

    pub fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn with_worker_defaults(mut self, defaults: WorkerConfig) -> Self {
        self.worker_defaults = defaults;
        self
    }

    pub fn validate(&self) -> Result<(), SupervisorError> {
        if self.monitor_interval.is_zero() {
            return Err(SupervisorError::InvalidConfig(
                "monitor_interval must be positive".into(),
            ));
        }
        if self.restart.base_delay.is_zero() {
            return Err(SupervisorError::InvalidConfig(
                "restart base_delay must be positive".into(),
            ));
        }
        if self.restart.max_delay < self.restart.base_delay {
            return Err(SupervisorError::InvalidConfig(
                "restart max_delay must not be below base_delay".into(),
            ));
        }
        self.worker_defaults
            .clone()
            .with_max_concurrency(self.worker_defaults.max_concurrency.max(1))
            .validate()
            .map_err(|e| SupervisorError::InvalidConfig(e.to_string()))
    }
}
