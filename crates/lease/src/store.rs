//! Storage ports for the coordination core.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use jobmesh_core::{InstanceId, JobId, JobScope, RoleKey, RunId};

use crate::registration::{RunOutcome, RunRecord, WorkerHeartbeat, WorkerRegistration};
use crate::types::{JobLease, JobStatus, NewJob};

/// Store operation error.
///
/// "Queue empty" and "lease lost" are not errors: they are `Ok(None)` from
/// `claim_next` and `Ok(false)` from the holder-checked writers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be reached (connectivity fault).
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    /// Connectivity faults are retried with backoff; everything else is logged.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }
}

/// Lease-based job queue.
///
/// ## Holding a lease
///
/// A caller holds a job's lease when `status = processing`, `claimed_by` is
/// the caller and `lease_expiry` is in the future. `renew`, `complete`,
/// `fail` and `release` only write while the caller holds the lease and
/// return `false` otherwise. A `false` means the lease was lost: the caller
/// must stop side-effecting work for that job.
///
/// ## Implementation requirements
///
/// `claim_next` must select and update in one indivisible step so two
/// concurrent callers can never both receive the same job.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Insert a new `pending` job.
    async fn enqueue(&self, job: NewJob) -> Result<JobLease, StoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<JobLease>, StoreError>;

    /// Claim one job that is `pending`, or `processing` with an expired lease.
    ///
    /// Returns `Ok(None)` when nothing is eligible.
    async fn claim_next(
        &self,
        instance_id: InstanceId,
        scope: Option<&JobScope>,
        lease_timeout: Duration,
    ) -> Result<Option<JobLease>, StoreError>;

    /// Extend the lease to `now + lease_timeout`.
    async fn renew(
        &self,
        job_id: JobId,
        instance_id: InstanceId,
        lease_timeout: Duration,
    ) -> Result<bool, StoreError>;

    async fn complete(
        &self,
        job_id: JobId,
        instance_id: InstanceId,
        result: serde_json::Value,
    ) -> Result<bool, StoreError>;

    async fn fail(
        &self,
        job_id: JobId,
        instance_id: InstanceId,
        error: &str,
    ) -> Result<bool, StoreError>;

    /// Voluntarily hand the job back to `pending`.
    async fn release(&self, job_id: JobId, instance_id: InstanceId) -> Result<bool, StoreError>;

    /// Reset `processing` jobs whose lease expired more than `global_timeout`
    /// ago back to `pending`. Returns the number of jobs reset.
    async fn expire_stale_leases(&self, global_timeout: Duration) -> Result<u64, StoreError>;

    /// List jobs, oldest first.
    async fn list_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobLease>, StoreError>;

    async fn stats(&self, scope: Option<&JobScope>) -> Result<JobStats, StoreError>;
}

/// Worker registrations (liveness + statistics).
#[async_trait]
pub trait HeartbeatStore: Send + Sync {
    /// Idempotent upsert keyed by `instance_id`; stamps `last_heartbeat`.
    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), StoreError>;

    async fn get_worker(
        &self,
        instance_id: InstanceId,
    ) -> Result<Option<WorkerRegistration>, StoreError>;

    async fn list_workers(&self, role: Option<&RoleKey>)
    -> Result<Vec<WorkerRegistration>, StoreError>;

    /// Delete registrations whose last heartbeat is older than `stale_after`.
    async fn delete_stale_workers(&self, stale_after: Duration) -> Result<u64, StoreError>;
}

/// Audit log of runtime cycles.
#[async_trait]
pub trait RunLog: Send + Sync {
    async fn begin_run(&self, record: &RunRecord) -> Result<(), StoreError>;

    /// Close a run; stamps `completed_at`.
    async fn finish_run(&self, run_id: RunId, outcome: &RunOutcome) -> Result<(), StoreError>;

    async fn list_runs(&self, instance_id: InstanceId) -> Result<Vec<RunRecord>, StoreError>;
}

/// Everything a WorkerRuntime or Supervisor needs from the backing store.
pub trait CoordinationStore: LeaseStore + HeartbeatStore + RunLog + 'static {}

impl<S> CoordinationStore for S where S: LeaseStore + HeartbeatStore + RunLog + 'static {}

#[async_trait]
impl<S> LeaseStore for Arc<S>
where
    S: LeaseStore + ?Sized,
{
    async fn enqueue(&self, job: NewJob) -> Result<JobLease, StoreError> {
        (**self).enqueue(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobLease>, StoreError> {
        (**self).get(job_id).await
    }

    async fn claim_next(
        &self,
        instance_id: InstanceId,
        scope: Option<&JobScope>,
        lease_timeout: Duration,
    ) -> Result<Option<JobLease>, StoreError> {
        (**self).claim_next(instance_id, scope, lease_timeout).await
    }

    async fn renew(
        &self,
        job_id: JobId,
        instance_id: InstanceId,
        lease_timeout: Duration,
    ) -> Result<bool, StoreError> {
        (**self).renew(job_id, instance_id, lease_timeout).await
    }

    async fn complete(
        &self,
        job_id: JobId,
        instance_id: InstanceId,
        result: serde_json::Value,
    ) -> Result<bool, StoreError> {
        (**self).complete(job_id, instance_id, result).await
    }

    async fn fail(
        &self,
        job_id: JobId,
        instance_id: InstanceId,
        error: &str,
    ) -> Result<bool, StoreError> {
        (**self).fail(job_id, instance_id, error).await
    }

    async fn release(&self, job_id: JobId, instance_id: InstanceId) -> Result<bool, StoreError> {
        (**self).release(job_id, instance_id).await
    }

    async fn expire_stale_leases(&self, global_timeout: Duration) -> Result<u64, StoreError> {
        (**self).expire_stale_leases(global_timeout).await
    }

    async fn list_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobLease>, StoreError> {
        (**self).list_by_status(status, limit).await
    }

    async fn stats(&self, scope: Option<&JobScope>) -> Result<JobStats, StoreError> {
        (**self).stats(scope).await
    }
}

#[async_trait]
impl<S> HeartbeatStore for Arc<S>
where
    S: HeartbeatStore + ?Sized,
{
    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), StoreError> {
        (**self).upsert_heartbeat(heartbeat).await
    }

    async fn get_worker(
        &self,
        instance_id: InstanceId,
    ) -> Result<Option<WorkerRegistration>, StoreError> {
        (**self).get_worker(instance_id).await
    }

    async fn list_workers(
        &self,
        role: Option<&RoleKey>,
    ) -> Result<Vec<WorkerRegistration>, StoreError> {
        (**self).list_workers(role).await
    }

    async fn delete_stale_workers(&self, stale_after: Duration) -> Result<u64, StoreError> {
        (**self).delete_stale_workers(stale_after).await
    }
}

#[async_trait]
impl<S> RunLog for Arc<S>
where
    S: RunLog + ?Sized,
{
    async fn begin_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        (**self).begin_run(record).await
    }

    async fn finish_run(&self, run_id: RunId, outcome: &RunOutcome) -> Result<(), StoreError> {
        (**self).finish_run(run_id, outcome).await
    }

    async fn list_runs(&self, instance_id: InstanceId) -> Result<Vec<RunRecord>, StoreError> {
        (**self).list_runs(instance_id).await
    }
}
