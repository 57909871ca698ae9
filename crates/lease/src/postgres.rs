//! Postgres-backed coordination store.
//!
//! ## Claim
//!
//! `claim_next` is a single statement: the inner `SELECT ... FOR UPDATE SKIP
//! LOCKED` picks and row-locks one eligible job, the outer `UPDATE` takes the
//! lease. Concurrent claimers skip rows another transaction has locked, so two
//! callers can never receive the same job.
//!
//! ## Time
//!
//! Lease arithmetic uses the database's `NOW()`, never the caller's clock, so
//! workers with skewed clocks still agree on expiry.
//!
//! ## Error Mapping
//!
//! | SQLx Error | StoreError |
//! |------------|------------|
//! | `PoolClosed`, `PoolTimedOut`, `Io`, `Tls` | `Unavailable` (retried by the runtime) |
//! | Database `23505` on insert | `AlreadyExists` |
//! | anything else | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use jobmesh_core::{InstanceId, JobId, JobScope, RoleKey, RunId};

use crate::registration::{
    RunOutcome, RunRecord, WorkerCounters, WorkerHeartbeat, WorkerRegistration,
};
use crate::store::{HeartbeatStore, JobStats, LeaseStore, RunLog, StoreError};
use crate::types::{JobLease, JobStatus, NewJob};

const JOB_COLUMNS: &str = "id, scope, payload, status, claimed_by, lease_expiry, result, error, \
                           attempts, created_at, updated_at";

/// Postgres lease store, heartbeat store and run log.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the tables and indexes if they do not exist.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(include_str!("../migrations/0001_jobmesh.sql"))
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Interpret a zero-row holder-checked write: lost lease or missing job.
    async fn holder_write_result(
        &self,
        operation: &str,
        job_id: JobId,
        rows_affected: u64,
    ) -> Result<bool, StoreError> {
        if rows_affected > 0 {
            return Ok(true);
        }

        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM jobmesh_jobs WHERE id = $1)")
            .bind(job_id.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        if exists {
            Ok(false)
        } else {
            Err(StoreError::NotFound(job_id))
        }
    }
}

fn secs(d: Duration) -> f64 {
    d.as_secs_f64()
}

#[async_trait]
impl LeaseStore for PostgresStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn enqueue(&self, job: NewJob) -> Result<JobLease, StoreError> {
        let job_id = job.id;
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO jobmesh_jobs (id, scope, payload)
            VALUES ($1, $2, $3)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id.as_uuid())
        .bind(job.scope.as_ref().map(|s| s.as_str()))
        .bind(&job.payload)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(job_id)
            } else {
                map_sqlx_error("enqueue", e)
            }
        })?;

        job_from_row(&row)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<JobLease>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobmesh_jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(instance_id = %instance_id), err)]
    async fn claim_next(
        &self,
        instance_id: InstanceId,
        scope: Option<&JobScope>,
        lease_timeout: Duration,
    ) -> Result<Option<JobLease>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobmesh_jobs
            SET status = 'processing',
                claimed_by = $1,
                lease_expiry = NOW() + make_interval(secs => $3),
                attempts = attempts + 1,
                updated_at = NOW()
            WHERE id = (
                SELECT id
                FROM jobmesh_jobs
                WHERE ($2::text IS NULL OR scope = $2)
                  AND (
                        status = 'pending'
                     OR (status = 'processing' AND (lease_expiry IS NULL OR lease_expiry <= NOW()))
                  )
                ORDER BY created_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(instance_id.as_uuid())
        .bind(scope.map(|s| s.as_str()))
        .bind(secs(lease_timeout))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(job_id = %job_id, instance_id = %instance_id), err)]
    async fn renew(
        &self,
        job_id: JobId,
        instance_id: InstanceId,
        lease_timeout: Duration,
    ) -> Result<bool, StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE jobmesh_jobs
            SET lease_expiry = NOW() + make_interval(secs => $3),
                updated_at = NOW()
            WHERE id = $1
              AND claimed_by = $2
              AND status = 'processing'
              AND lease_expiry > NOW()
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(instance_id.as_uuid())
        .bind(secs(lease_timeout))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew", e))?;

        self.holder_write_result("renew", job_id, done.rows_affected()).await
    }

    #[instrument(skip(self, result), fields(job_id = %job_id, instance_id = %instance_id), err)]
    async fn complete(
        &self,
        job_id: JobId,
        instance_id: InstanceId,
        result: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE jobmesh_jobs
            SET status = 'completed',
                result = $3,
                lease_expiry = NULL,
                updated_at = NOW()
            WHERE id = $1
              AND claimed_by = $2
              AND status = 'processing'
              AND lease_expiry > NOW()
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(instance_id.as_uuid())
        .bind(&result)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        self.holder_write_result("complete", job_id, done.rows_affected()).await
    }

    #[instrument(skip(self), fields(job_id = %job_id, instance_id = %instance_id), err)]
    async fn fail(
        &self,
        job_id: JobId,
        instance_id: InstanceId,
        error: &str,
    ) -> Result<bool, StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE jobmesh_jobs
            SET status = 'failed',
                error = $3,
                lease_expiry = NULL,
                updated_at = NOW()
            WHERE id = $1
              AND claimed_by = $2
              AND status = 'processing'
              AND lease_expiry > NOW()
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(instance_id.as_uuid())
        .bind(error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;

        self.holder_write_result("fail", job_id, done.rows_affected()).await
    }

    #[instrument(skip(self), fields(job_id = %job_id, instance_id = %instance_id), err)]
    async fn release(&self, job_id: JobId, instance_id: InstanceId) -> Result<bool, StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE jobmesh_jobs
            SET status = 'pending',
                claimed_by = NULL,
                lease_expiry = NULL,
                updated_at = NOW()
            WHERE id = $1
              AND claimed_by = $2
              AND status = 'processing'
              AND lease_expiry > NOW()
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(instance_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?;

        self.holder_write_result("release", job_id, done.rows_affected()).await
    }

    #[instrument(skip(self), err)]
    async fn expire_stale_leases(&self, global_timeout: Duration) -> Result<u64, StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE jobmesh_jobs
            SET status = 'pending',
                claimed_by = NULL,
                lease_expiry = NULL,
                updated_at = NOW()
            WHERE status = 'processing'
              AND (lease_expiry IS NULL OR lease_expiry <= NOW() - make_interval(secs => $1))
            "#,
        )
        .bind(secs(global_timeout))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("expire_stale_leases", e))?;

        Ok(done.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn list_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobLease>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobmesh_jobs
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY created_at, id
            LIMIT $2
            "#
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(sql_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_status", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self, scope: Option<&JobScope>) -> Result<JobStats, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS total
            FROM jobmesh_jobs
            WHERE ($1::text IS NULL OR scope = $1)
            GROUP BY status
            "#,
        )
        .bind(scope.map(|s| s.as_str()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(decode_error)?;
            let total: i64 = row.try_get("total").map_err(decode_error)?;
            let status = status.parse::<JobStatus>().map_err(StoreError::Storage)?;
            match status {
                JobStatus::Pending => stats.pending = total as usize,
                JobStatus::Processing => stats.processing = total as usize,
                JobStatus::Completed => stats.completed = total as usize,
                JobStatus::Failed => stats.failed = total as usize,
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl HeartbeatStore for PostgresStore {
    #[instrument(skip(self, heartbeat), fields(instance_id = %heartbeat.instance_id), err)]
    async fn upsert_heartbeat(&self, heartbeat: &WorkerHeartbeat) -> Result<(), StoreError> {
        let counters = &heartbeat.counters;
        sqlx::query(
            r#"
            INSERT INTO jobmesh_workers (
                instance_id,
                role,
                status,
                current_job_count,
                total_processed,
                total_failed,
                average_duration_ms,
                last_heartbeat
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (instance_id)
            DO UPDATE SET
                role = EXCLUDED.role,
                status = EXCLUDED.status,
                current_job_count = EXCLUDED.current_job_count,
                total_processed = EXCLUDED.total_processed,
                total_failed = EXCLUDED.total_failed,
                average_duration_ms = EXCLUDED.average_duration_ms,
                last_heartbeat = NOW()
            "#,
        )
        .bind(heartbeat.instance_id.as_uuid())
        .bind(heartbeat.role.as_str())
        .bind(heartbeat.status.as_str())
        .bind(counters.current_job_count as i32)
        .bind(counters.total_processed as i64)
        .bind(counters.total_failed as i64)
        .bind(counters.average_duration.as_millis() as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_heartbeat", e))?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_worker(
        &self,
        instance_id: InstanceId,
    ) -> Result<Option<WorkerRegistration>, StoreError> {
        let row = sqlx::query("SELECT * FROM jobmesh_workers WHERE instance_id = $1")
            .bind(instance_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_worker", e))?;

        row.as_ref().map(worker_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_workers(
        &self,
        role: Option<&RoleKey>,
    ) -> Result<Vec<WorkerRegistration>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT *
            FROM jobmesh_workers
            WHERE ($1::text IS NULL OR role = $1)
            ORDER BY last_heartbeat
            "#,
        )
        .bind(role.map(|r| r.as_str()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_workers", e))?;

        rows.iter().map(worker_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn delete_stale_workers(&self, stale_after: Duration) -> Result<u64, StoreError> {
        let done = sqlx::query(
            "DELETE FROM jobmesh_workers WHERE last_heartbeat <= NOW() - make_interval(secs => $1)",
        )
        .bind(secs(stale_after))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete_stale_workers", e))?;

        Ok(done.rows_affected())
    }
}

#[async_trait]
impl RunLog for PostgresStore {
    #[instrument(skip(self, record), fields(run_id = %record.id), err)]
    async fn begin_run(&self, record: &RunRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobmesh_runs (
                id, job_name, instance_id, status, started_at, completed_at,
                jobs_claimed, jobs_failed, error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(&record.job_name)
        .bind(record.instance_id.as_uuid())
        .bind(record.status.as_str())
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(record.jobs_claimed as i32)
        .bind(record.jobs_failed as i32)
        .bind(record.error.as_deref())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("begin_run", e))?;

        Ok(())
    }

    #[instrument(skip(self, outcome), err)]
    async fn finish_run(&self, run_id: RunId, outcome: &RunOutcome) -> Result<(), StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE jobmesh_runs
            SET status = $2,
                jobs_failed = $3,
                error = $4,
                completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(outcome.status.as_str())
        .bind(outcome.jobs_failed as i32)
        .bind(outcome.error.as_deref())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("finish_run", e))?;

        if done.rows_affected() == 0 {
            return Err(StoreError::Storage(format!("run not found: {run_id}")));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_runs(&self, instance_id: InstanceId) -> Result<Vec<RunRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM jobmesh_runs WHERE instance_id = $1 ORDER BY started_at",
        )
        .bind(instance_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_runs", e))?;

        rows.iter().map(run_from_row).collect()
    }
}

fn job_from_row(row: &PgRow) -> Result<JobLease, StoreError> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    let scope: Option<String> = row.try_get("scope").map_err(decode_error)?;
    let claimed_by: Option<uuid::Uuid> = row.try_get("claimed_by").map_err(decode_error)?;
    let attempts: i32 = row.try_get("attempts").map_err(decode_error)?;

    Ok(JobLease {
        id: JobId::from_uuid(row.try_get("id").map_err(decode_error)?),
        scope: scope.map(|s| JobScope::from(s.as_str())),
        payload: row.try_get("payload").map_err(decode_error)?,
        status: status.parse().map_err(StoreError::Storage)?,
        claimed_by: claimed_by.map(InstanceId::from_uuid),
        lease_expiry: row.try_get("lease_expiry").map_err(decode_error)?,
        result: row.try_get("result").map_err(decode_error)?,
        error: row.try_get("error").map_err(decode_error)?,
        attempts: attempts.max(0) as u32,
        created_at: row.try_get("created_at").map_err(decode_error)?,
        updated_at: row.try_get("updated_at").map_err(decode_error)?,
    })
}

fn worker_from_row(row: &PgRow) -> Result<WorkerRegistration, StoreError> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    let role: String = row.try_get("role").map_err(decode_error)?;
    let current_job_count: i32 = row.try_get("current_job_count").map_err(decode_error)?;
    let total_processed: i64 = row.try_get("total_processed").map_err(decode_error)?;
    let total_failed: i64 = row.try_get("total_failed").map_err(decode_error)?;
    let average_duration_ms: i64 = row.try_get("average_duration_ms").map_err(decode_error)?;
    let last_heartbeat: DateTime<Utc> = row.try_get("last_heartbeat").map_err(decode_error)?;

    Ok(WorkerRegistration {
        instance_id: InstanceId::from_uuid(row.try_get("instance_id").map_err(decode_error)?),
        role: RoleKey::from(role.as_str()),
        status: status.parse().map_err(StoreError::Storage)?,
        counters: WorkerCounters {
            current_job_count: current_job_count.max(0) as u32,
            total_processed: total_processed.max(0) as u64,
            total_failed: total_failed.max(0) as u64,
            average_duration: Duration::from_millis(average_duration_ms.max(0) as u64),
        },
        last_heartbeat,
    })
}

fn run_from_row(row: &PgRow) -> Result<RunRecord, StoreError> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    let jobs_claimed: i32 = row.try_get("jobs_claimed").map_err(decode_error)?;
    let jobs_failed: i32 = row.try_get("jobs_failed").map_err(decode_error)?;

    Ok(RunRecord {
        id: RunId::from_uuid(row.try_get("id").map_err(decode_error)?),
        job_name: row.try_get("job_name").map_err(decode_error)?,
        instance_id: InstanceId::from_uuid(row.try_get("instance_id").map_err(decode_error)?),
        status: status.parse().map_err(StoreError::Storage)?,
        started_at: row.try_get("started_at").map_err(decode_error)?,
        completed_at: row.try_get("completed_at").map_err(decode_error)?,
        jobs_claimed: jobs_claimed.max(0) as u32,
        jobs_failed: jobs_failed.max(0) as u32,
        error: row.try_get("error").map_err(decode_error)?,
    })
}

fn decode_error(err: sqlx::Error) -> StoreError {
    StoreError::Storage(format!("failed to decode row: {err}"))
}

/// `LIMIT` argument; Postgres rejects negatives, so oversized limits saturate.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Map SQLx errors to `StoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Unavailable(format!("timed out acquiring connection in {operation}"))
        }
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {operation}: {e}")),
        sqlx::Error::Tls(e) => StoreError::Unavailable(format!("tls error in {operation}: {e}")),
        sqlx::Error::Database(db_err) => {
            StoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        other => StoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}
