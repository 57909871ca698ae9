//! Run-record bookkeeping for runtime cycles.
//!
//! Run records are audit data. Write failures are logged and swallowed.

use chrono::Utc;
use tracing::warn;

use jobmesh_core::{InstanceId, RunId};
use jobmesh_lease::{RunLog, RunOutcome, RunRecord, RunStatus};

/// Open a run record for a cycle that claimed `jobs_claimed` jobs.
///
/// Returns `None` if the record could not be written.
pub async fn begin_run<L>(
    log: &L,
    job_name: &str,
    instance_id: InstanceId,
    jobs_claimed: u32,
) -> Option<RunId>
where
    L: RunLog + ?Sized,
{
    let record = RunRecord::started(job_name, instance_id, jobs_claimed, Utc::now());
    match log.begin_run(&record).await {
        Ok(()) => Some(record.id),
        Err(e) => {
            warn!(job_name, instance_id = %instance_id, error = %e, "failed to begin run record");
            None
        }
    }
}

/// Close a run record opened by [`begin_run`].
pub async fn finish_run<L>(log: &L, run_id: Option<RunId>, outcome: RunOutcome)
where
    L: RunLog + ?Sized,
{
    let Some(run_id) = run_id else {
        return;
    };
    if let Err(e) = log.finish_run(run_id, &outcome).await {
        warn!(run_id = %run_id, error = %e, "failed to finish run record");
    }
}

/// Build the outcome of a cycle from its failure count and first error.
pub fn cycle_outcome(jobs_failed: u32, first_error: Option<String>) -> RunOutcome {
    RunOutcome {
        status: if jobs_failed == 0 {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        },
        jobs_failed,
        error: first_error,
    }
}
