//! Worker registrations and run records.
//!
//! Both are observability data: nothing in the claim protocol reads them to
//! decide who owns a job.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobmesh_core::{InstanceId, RoleKey, RunId};

/// Reported state of a WorkerRuntime instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Processing,
    Paused,
    Stopped,
    Error,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Processing => "processing",
            WorkerStatus::Paused => "paused",
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Error => "error",
        }
    }
}

impl core::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(WorkerStatus::Idle),
            "processing" => Ok(WorkerStatus::Processing),
            "paused" => Ok(WorkerStatus::Paused),
            "stopped" => Ok(WorkerStatus::Stopped),
            "error" => Ok(WorkerStatus::Error),
            other => Err(format!("unknown worker status: {other}")),
        }
    }
}

/// Rolling counters published with every heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCounters {
    pub current_job_count: u32,
    pub total_processed: u64,
    pub total_failed: u64,
    /// Mean job duration over the most recent samples.
    pub average_duration: Duration,
}

/// One heartbeat, as sent by a worker. The store stamps `last_heartbeat`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub instance_id: InstanceId,
    pub role: RoleKey,
    pub status: WorkerStatus,
    pub counters: WorkerCounters,
}

/// Stored registration row, upserted by `instance_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub instance_id: InstanceId,
    pub role: RoleKey,
    pub status: WorkerStatus,
    pub counters: WorkerCounters,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerRegistration {
    pub fn from_heartbeat(heartbeat: &WorkerHeartbeat, at: DateTime<Utc>) -> Self {
        Self {
            instance_id: heartbeat.instance_id,
            role: heartbeat.role.clone(),
            status: heartbeat.status,
            counters: heartbeat.counters,
            last_heartbeat: at,
        }
    }
}

/// Status of one execution cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Audit record for one runtime cycle (possibly many jobs).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub job_name: String,
    pub instance_id: InstanceId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub jobs_claimed: u32,
    pub jobs_failed: u32,
    pub error: Option<String>,
}

impl RunRecord {
    pub fn started(
        job_name: impl Into<String>,
        instance_id: InstanceId,
        jobs_claimed: u32,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RunId::new(),
            job_name: job_name.into(),
            instance_id,
            status: RunStatus::Running,
            started_at: at,
            completed_at: None,
            jobs_claimed,
            jobs_failed: 0,
            error: None,
        }
    }

    pub fn apply_outcome(&mut self, outcome: &RunOutcome, at: DateTime<Utc>) {
        self.status = outcome.status;
        self.jobs_failed = outcome.jobs_failed;
        self.error = outcome.error.clone();
        self.completed_at = Some(at);
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub jobs_failed: u32,
    /// First error seen in the cycle, if any.
    pub error: Option<String>,
}
