//! In-memory coordination store for tests/dev.
//!
//! One `RwLock` guards the job map, so `claim_next` selects and updates under
//! the same write guard. Time comes from an injected [`Clock`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;

use jobmesh_core::clock::to_chrono;
use jobmesh_core::{Clock, InstanceId, JobId, JobScope, RoleKey, RunId, SystemClock};

use crate::registration::{RunOutcome, RunRecord, WorkerHeartbeat, WorkerRegistration};
use crate::store::{HeartbeatStore, JobStats, LeaseStore, RunLog, StoreError};
use crate::types::{JobLease, JobStatus, NewJob};

/// In-memory lease store, heartbeat store and run log.
pub struct InMemoryStore {
    clock: Arc<dyn Clock>,
    jobs: RwLock<HashMap<JobId, JobLease>>,
    workers: RwLock<HashMap<InstanceId, WorkerRegistration>>,
    runs: RwLock<Vec<RunRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            jobs: RwLock::new(HashMap::new()),
            workers: RwLock::new(HashMap::new()),
            runs: RwLock::new(Vec::new()),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Mutate a job only if `instance_id` holds its live lease.
    fn with_held_job(
        &self,
        job_id: JobId,
        instance_id: InstanceId,
        f: impl FnOnce(&mut JobLease),
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut jobs = write(&self.jobs);
        match jobs.get_mut(&job_id) {
            Some(job) if job.is_held_by(instance_id, now) => {
                f(job);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(job_id)),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("jobs", &read(&self.jobs).len())
            .field("workers", &read(&self.workers).len())
            .field("runs", &read(&self.runs).len())
            .finish()
    }
}

// A poisoned lock only means another caller panicked mid-operation; every
// mutation here is a single field assignment, so the map is still coherent.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

#[async_trait]
impl LeaseStore for InMemoryStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobLease, StoreError> {
        let mut jobs = write(&self.jobs);
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        let lease = job.into_lease(self.clock.now());
        jobs.insert(lease.id, lease.clone());
        Ok(lease)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobLease>, StoreError> {
        Ok(read(&self.jobs).get(&job_id).cloned())
    }

    async fn claim_next(
        &self,
        instance_id: InstanceId,
        scope: Option<&JobScope>,
        lease_timeout: Duration,
    ) -> Result<Option<JobLease>, StoreError> {
        let now = self.clock.now();
        let mut jobs = write(&self.jobs);

        // Oldest eligible job first.
        let next = jobs
            .values()
            .filter(|j| j.in_scope(scope) && j.is_claimable_at(now))
            .min_by_key(|j| (j.created_at, j.id))
            .map(|j| j.id);

        Ok(next.and_then(|id| {
            let job = jobs.get_mut(&id)?;
            job.mark_claimed(instance_id, now, lease_timeout);
            Some(job.clone())
        }))
    }

    async fn renew(
        &self,
        job_id: JobId,
        instance_id: InstanceId,
        lease_timeout: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        self.with_held_job(job_id, instance_id, |job| job.mark_renewed(now, lease_timeout))
    }

    async fn complete(
        &self,
        job_id: JobId,
        instance_id: InstanceId,
        result: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        self.with_held_job(job_id, instance_id, |job| job.mark_completed(result, now))
    }

    async fn fail(
        &self,
        job_id: JobId,
        instance_id: InstanceId,
        error: &str,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        self.with_held_job(job_id, instance_id, |job| {
            job.mark_failed(error.to_string(), now)
        })
    }

    async fn release(&self, job_id: JobId, instance_id: InstanceId) -> Result<bool, StoreError> {
        let now = self.clock.now();
        self.with_held_job(job_id, instance_id, |job| job.mark_pending(now))
    }

    async fn expire_stale_leases(&self, global_timeout: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let cutoff = now - to_chrono(global_timeout);
        let mut jobs = write(&self.jobs);

        let mut expired = 0;
        for job in jobs.values_mut() {
            let stale = job.status == JobStatus::Processing
                && job.lease_expiry.is_none_or(|exp| exp <= cutoff);
            if stale {
                job.mark_pending(now);
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn list_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobLease>, StoreError> {
        let jobs = read(&self.jobs);
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(&self, scope: Option<&JobScope>) -> Result<JobStats, StoreError> {
        let jobs = read(&self.jobs);
        let mut stats = JobStats::default();
        for job in jobs.values().filter(|j| j.in_scope(scope)) {
            stats.record(job.status);
        }
        Ok(stats)
    }
}

#[async_trait]
impl HeartbeatStore for InMemoryStore {
    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), StoreError> {
        let registration = WorkerRegistration::from_heartbeat(heartbeat, self.clock.now());
        write(&self.workers).insert(heartbeat.instance_id, registration);
        Ok(())
    }

    async fn get_worker(
        &self,
        instance_id: InstanceId,
    ) -> Result<Option<WorkerRegistration>, StoreError> {
        Ok(read(&self.workers).get(&instance_id).cloned())
    }

    async fn list_workers(
        &self,
        role: Option<&RoleKey>,
    ) -> Result<Vec<WorkerRegistration>, StoreError> {
        let workers = read(&self.workers);
        let mut result: Vec<_> = workers
            .values()
            .filter(|w| role.is_none_or(|r| &w.role == r))
            .cloned()
            .collect();
        result.sort_by_key(|w| w.last_heartbeat);
        Ok(result)
    }

    async fn delete_stale_workers(&self, stale_after: Duration) -> Result<u64, StoreError> {
        let cutoff = self.clock.now() - to_chrono(stale_after);
        let mut workers = write(&self.workers);
        let before = workers.len();
        workers.retain(|_, w| w.last_heartbeat > cutoff);
        Ok((before - workers.len()) as u64)
    }
}

#[async_trait]
impl RunLog for InMemoryStore {
    async fn begin_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        write(&self.runs).push(record.clone());
        Ok(())
    }

    async fn finish_run(&self, run_id: RunId, outcome: &RunOutcome) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut runs = write(&self.runs);
        let run = runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or_else(|| StoreError::Storage(format!("run not found: {run_id}")))?;
        run.apply_outcome(outcome, now);
        Ok(())
    }

    async fn list_runs(&self, instance_id: InstanceId) -> Result<Vec<RunRecord>, StoreError> {
        Ok(read(&self.runs)
            .iter()
            .filter(|r| r.instance_id == instance_id)
            .cloned()
            .collect())
    }
}
