#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use jobmesh_core::{InstanceId, JobId, JobScope, RoleKey, RunId};
use jobmesh_lease::{
    HeartbeatStore, InMemoryStore, JobLease, JobStats, JobStatus, LeaseStore, NewJob, RunLog,
    RunOutcome, RunRecord, StoreError, WorkerHeartbeat, WorkerRegistration,
};

/// In-memory store that counts claim attempts and can fail the first few.
pub struct ScriptedStore {
    pub inner: Arc<InMemoryStore>,
    claims: AtomicUsize,
    failing_claims: AtomicUsize,
}

impl ScriptedStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            claims: AtomicUsize::new(0),
            failing_claims: AtomicUsize::new(0),
        })
    }

    /// Make the next `n` claim attempts fail as if the store were down.
    pub fn fail_next_claims(&self, n: usize) {
        self.failing_claims.store(n, Ordering::SeqCst);
    }

    pub fn claim_attempts(&self) -> usize {
        self.claims.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeaseStore for ScriptedStore {
    async fn enqueue(&self, job: NewJob) -> Result<JobLease, StoreError> {
        self.inner.enqueue(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobLease>, StoreError> {
        self.inner.get(job_id).await
    }

    async fn claim_next(
        &self,
        instance_id: InstanceId,
        scope: Option<&JobScope>,
        lease_timeout: Duration,
    ) -> Result<Option<JobLease>, StoreError> {
        self.claims.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_claims
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StoreError::Unavailable("connection refused".into()));
        }
        self.inner.claim_next(instance_id, scope, lease_timeout).await
    }

    async fn renew(
        &self,
        job_id: JobId,
        instance_id: InstanceId,
        lease_timeout: Duration,
    ) -> Result<bool, StoreError> {
        self.inner.renew(job_id, instance_id, lease_timeout).await
    }

    async fn complete(
        &self,
        job_id: JobId,
        instance_id: InstanceId,
        result: serde_json::Value,
    ) -> Result<bool, StoreError> {
        self.inner.complete(job_id, instance_id, result).await
    }

    async fn fail(
        &self,
        job_id: JobId,
        instance_id: InstanceId,
        error: &str,
    ) -> Result<bool, StoreError> {
        self.inner.fail(job_id, instance_id, error).await
    }

    async fn release(&self, job_id: JobId, instance_id: InstanceId) -> Result<bool, StoreError> {
        self.inner.release(job_id, instance_id).await
    }

    async fn expire_stale_leases(&self, global_timeout: Duration) -> Result<u64, StoreError> {
        self.inner.expire_stale_leases(global_timeout).await
    }

    async fn list_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobLease>, StoreError> {
        self.inner.list_by_status(status, limit).await
    }

    async fn stats(&self, scope: Option<&JobScope>) -> Result<JobStats, StoreError> {
        self.inner.stats(scope).await
    }
}

#[async_trait]
impl HeartbeatStore for ScriptedStore {
    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), StoreError> {
        self.inner.upsert_heartbeat(heartbeat).await
    }

    async fn get_worker(
        &self,
        instance_id: InstanceId,
    ) -> Result<Option<WorkerRegistration>, StoreError> {
        self.inner.get_worker(instance_id).await
    }

    async fn list_workers(
        &self,
        role: Option<&RoleKey>,
    ) -> Result<Vec<WorkerRegistration>, StoreError> {
        self.inner.list_workers(role).await
    }

    async fn delete_stale_workers(&self, stale_after: Duration) -> Result<u64, StoreError> {
        self.inner.delete_stale_workers(stale_after).await
    }
}

#[async_trait]
impl RunLog for ScriptedStore {
    async fn begin_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        self.inner.begin_run(record).await
    }

    async fn finish_run(&self, run_id: RunId, outcome: &RunOutcome) -> Result<(), StoreError> {
        self.inner.finish_run(run_id, outcome).await
    }

    async fn list_runs(&self, instance_id: InstanceId) -> Result<Vec<RunRecord>, StoreError> {
        self.inner.list_runs(instance_id).await
    }
}

/// Poll `check` every 100ms (tokio time) until it returns `true`.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..6_000 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("condition not reached within 10 minutes of tokio time");
}
