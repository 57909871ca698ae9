//! Holder-side lease operations for one runtime instance.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use jobmesh_core::{InstanceId, JobId, RoleKey};
use jobmesh_lease::{LeaseStore, StoreError};

/// How one job left the pool.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    /// Handler failure, recorded with `fail`.
    Failed(String),
    /// Handed back to `pending` because a prerequisite was missing.
    Released(String),
    /// Another claimant owns the job now; nothing was written.
    LeaseLost,
    /// The terminal write could not reach the store. The lease will expire
    /// and the job will be redelivered.
    WriteFailed(String),
}

impl JobOutcome {
    /// Error text for run records, if this outcome counts as a failure.
    pub fn failure(&self) -> Option<&str> {
        match self {
            JobOutcome::Failed(msg) | JobOutcome::WriteFailed(msg) => Some(msg),
            JobOutcome::Completed | JobOutcome::Released(_) | JobOutcome::LeaseLost => None,
        }
    }
}

/// Lease operations bound to one instance id and lease timeout.
pub struct LeaseClient<S: ?Sized> {
    store: Arc<S>,
    instance_id: InstanceId,
    role: RoleKey,
    lease_timeout: Duration,
}

impl<S: ?Sized> Clone for LeaseClient<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            instance_id: self.instance_id,
            role: self.role.clone(),
            lease_timeout: self.lease_timeout,
        }
    }
}

impl<S> LeaseClient<S>
where
    S: LeaseStore + ?Sized,
{
    pub fn new(store: Arc<S>, instance_id: InstanceId, role: RoleKey, lease_timeout: Duration) -> Self {
        Self {
            store,
            instance_id,
            role,
            lease_timeout,
        }
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub async fn renew(&self, job_id: JobId) -> Result<bool, StoreError> {
        self.store
            .renew(job_id, self.instance_id, self.lease_timeout)
            .await
    }

    pub async fn complete(&self, job_id: JobId, result: serde_json::Value) -> JobOutcome {
        match self.store.complete(job_id, self.instance_id, result).await {
            Ok(true) => JobOutcome::Completed,
            Ok(false) => self.lost(job_id, "complete"),
            Err(e) => self.write_failed(job_id, "complete", e),
        }
    }

    pub async fn fail(&self, job_id: JobId, error: String) -> JobOutcome {
        match self.store.fail(job_id, self.instance_id, &error).await {
            Ok(true) => JobOutcome::Failed(error),
            Ok(false) => self.lost(job_id, "fail"),
            Err(e) => self.write_failed(job_id, "fail", e),
        }
    }

    pub async fn release(&self, job_id: JobId, reason: String) -> JobOutcome {
        match self.store.release(job_id, self.instance_id).await {
            Ok(true) => JobOutcome::Released(reason),
            Ok(false) => self.lost(job_id, "release"),
            Err(e) => self.write_failed(job_id, "release", e),
        }
    }

    fn lost(&self, job_id: JobId, operation: &str) -> JobOutcome {
        warn!(
            role = %self.role,
            instance_id = %self.instance_id,
            job_id = %job_id,
            operation,
            "lease lost before write; discarding"
        );
        JobOutcome::LeaseLost
    }

    fn write_failed(&self, job_id: JobId, operation: &str, err: StoreError) -> JobOutcome {
        error!(
            role = %self.role,
            instance_id = %self.instance_id,
            job_id = %job_id,
            operation,
            error = %err,
            "failed to record job outcome"
        );
        JobOutcome::WriteFailed(format!("{operation} failed: {err}"))
    }
}
