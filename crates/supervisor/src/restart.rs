//! Restart delays for crashed roles.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the delay grows with consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartStrategy {
    /// Same delay every time.
    #[default]
    Fixed,
    /// `base_delay * 2^(failures - 1)`, capped at `max_delay`.
    Exponential,
}

/// Restart policy for supervised roles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    pub strategy: RestartStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// A runtime that stayed up at least this long resets the failure streak.
    pub reset_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(30))
    }
}

impl RestartPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            strategy: RestartStrategy::Fixed,
            base_delay: delay,
            max_delay: delay,
            reset_after: Duration::from_secs(10 * 60),
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            strategy: RestartStrategy::Exponential,
            base_delay,
            max_delay,
            reset_after: Duration::from_secs(10 * 60),
        }
    }

    pub fn with_reset_after(mut self, reset_after: Duration) -> Self {
        self.reset_after = reset_after;
        self
    }

    /// Delay before restart number `failures` of a streak (1-indexed).
    pub fn delay_for(&self, failures: u32) -> Duration {
        match self.strategy {
            RestartStrategy::Fixed => self.base_delay,
            RestartStrategy::Exponential => {
                let shift = failures.saturating_sub(1).min(31);
                self.base_delay
                    .checked_mul(1u32 << shift)
                    .unwrap_or(self.max_delay)
                    .min(self.max_delay)
            }
        }
    }

    /// Failure streak after a runtime that lived for `uptime` exits.
    ///
    /// `None` means the role never started (startup fault).
    pub fn next_streak(&self, previous: u32, uptime: Option<Duration>) -> u32 {
        match uptime {
            Some(up) if up >= self.reset_after => 1,
            _ => previous.saturating_add(1),
        }
    }
}
