//! WorkerRuntime configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use jobmesh_core::{JobScope, RoleKey};

/// Errors returned by [`crate::WorkerRuntime::run`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("invalid worker config: {0}")]
    InvalidConfig(String),
}

/// Worker runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Role served by this runtime (heartbeats, run records, logs).
    pub role: RoleKey,
    /// Optional claim filter.
    pub scope: Option<JobScope>,
    /// Jobs in flight per cycle; `1` is sequential mode.
    pub max_concurrency: usize,
    pub lease_timeout: Duration,
    /// How often an in-flight lease is renewed; `None` means `lease_timeout / 3`.
    pub renew_interval: Option<Duration>,
    /// Sleep after a cycle that claimed nothing.
    pub idle_interval: Duration,
    /// Sleep after a claim failed (store unreachable).
    pub error_backoff: Duration,
    /// Period of the background heartbeat ticker.
    pub heartbeat_interval: Duration,
    /// Number of recent job durations in the moving average.
    pub duration_window: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            role: RoleKey::from("worker"),
            scope: None,
            max_concurrency: 1,
            lease_timeout: Duration::from_secs(10 * 60),
            renew_interval: None,
            idle_interval: Duration::from_secs(30),
            error_backoff: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(60),
            duration_window: 100,
        }
    }
}

impl WorkerConfig {
    pub fn new(role: RoleKey) -> Self {
        Self {
            role,
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: RoleKey) -> Self {
        self.role = role;
        self
    }

    pub fn with_scope(mut self, scope: JobScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    pub fn with_renew_interval(mut self, interval: Duration) -> Self {
        self.renew_interval = Some(interval);
        self
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_duration_window(mut self, window: usize) -> Self {
        self.duration_window = window;
        self
    }

    /// Renewal period actually used by the runtime.
    pub fn effective_renew_interval(&self) -> Duration {
        self.renew_interval
            .unwrap_or(self.lease_timeout / 3)
            .max(Duration::from_millis(1))
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.max_concurrency == 0 {
            return Err(WorkerError::InvalidConfig(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.lease_timeout.is_zero() {
            return Err(WorkerError::InvalidConfig("lease_timeout must be positive".into()));
        }
        if self.effective_renew_interval() >= self.lease_timeout {
            return Err(WorkerError::InvalidConfig(format!(
                "renew_interval ({:?}) must be shorter than lease_timeout ({:?})",
                self.effective_renew_interval(),
                self.lease_timeout
            )));
        }
        if self.idle_interval.is_zero() || self.error_backoff.is_zero() {
            return Err(WorkerError::InvalidConfig(
                "idle_interval and error_backoff must be positive".into(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(WorkerError::InvalidConfig(
                "heartbeat_interval must be positive".into(),
            ));
        }
        if self.duration_window == 0 {
            return Err(WorkerError::InvalidConfig("duration_window must be at least 1".into()));
        }
        Ok(())
    }
}
