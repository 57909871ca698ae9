//! Job lease types and state transitions.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobmesh_core::clock::to_chrono;
use jobmesh_core::{InstanceId, JobId, JobScope};

/// Lease status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed; has no claimant.
    Pending,
    /// Claimed by a worker until `lease_expiry`.
    Processing,
    /// Finished successfully (terminal).
    Completed,
    /// Finished with an error (terminal).
    Failed,
}

impl JobStatus {
    /// Terminal jobs are never claimed again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A unit of work and its lease state.
///
/// Invariants (enforced by the stores, not by this struct):
/// - at most one live `processing` lease per job id
/// - `pending` jobs have no claimant
/// - `result` / `error` are written once, on entry into a terminal state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLease {
    pub id: JobId,
    /// Optional claim filter (batch, tenant, ...).
    pub scope: Option<JobScope>,
    /// Opaque work description, never interpreted by the coordination core.
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub claimed_by: Option<InstanceId>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Number of times the job has been claimed.
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobLease {
    /// `true` if the job is `processing` under a lease that has not expired at `now`.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing && self.lease_expiry.is_some_and(|exp| exp > now)
    }

    /// `true` if `claim_next` may hand this job out at `now`.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => true,
            JobStatus::Processing => !self.is_live_at(now),
            JobStatus::Completed | JobStatus::Failed => false,
        }
    }

    /// `true` if `instance_id` currently holds a live lease on this job.
    pub fn is_held_by(&self, instance_id: InstanceId, now: DateTime<Utc>) -> bool {
        self.claimed_by == Some(instance_id) && self.is_live_at(now)
    }

    /// Whether the job matches an optional scope filter.
    pub fn in_scope(&self, scope: Option<&JobScope>) -> bool {
        scope.is_none_or(|s| self.scope.as_ref() == Some(s))
    }

    /// Take (or re-take) the lease.
    pub fn mark_claimed(&mut self, instance_id: InstanceId, now: DateTime<Utc>, lease_timeout: Duration) {
        self.status = JobStatus::Processing;
        self.claimed_by = Some(instance_id);
        self.lease_expiry = Some(now + to_chrono(lease_timeout));
        self.attempts += 1;
        self.updated_at = now;
    }

    pub fn mark_renewed(&mut self, now: DateTime<Utc>, lease_timeout: Duration) {
        self.lease_expiry = Some(now + to_chrono(lease_timeout));
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.lease_expiry = None;
        self.updated_at = now;
    }

    pub fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.lease_expiry = None;
        self.updated_at = now;
    }

    /// Return the job to `pending` with no claimant.
    ///
    /// Used both for voluntary release and for stale-lease expiry.
    pub fn mark_pending(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.claimed_by = None;
        self.lease_expiry = None;
        self.updated_at = now;
    }
}

/// A job as submitted by a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub id: JobId,
    pub scope: Option<JobScope>,
    pub payload: serde_json::Value,
}

impl NewJob {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            scope: None,
            payload,
        }
    }

    pub fn with_scope(mut self, scope: JobScope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Use a caller-chosen id (idempotent producers).
    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn into_lease(self, now: DateTime<Utc>) -> JobLease {
        JobLease {
            id: self.id,
            scope: self.scope,
            payload: self.payload,
            status: JobStatus::Pending,
            claimed_by: None,
            lease_expiry: None,
            result: None,
            error: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }
}
