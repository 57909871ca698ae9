//! The work-function contract.

use std::future::Future;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use jobmesh_core::{JobId, JobScope};

/// Error returned by a [`JobHandler`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// The job failed; recorded with `fail`.
    #[error("job failed: {0}")]
    Failed(String),
    /// A prerequisite is missing; the job is released back to `pending`.
    #[error("job not ready: {0}")]
    NotReady(String),
}

impl JobError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn not_ready(msg: impl Into<String>) -> Self {
        Self::NotReady(msg.into())
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(format!("{err:#}"))
    }
}

/// What a handler gets to work with.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub scope: Option<JobScope>,
    /// How many times the job has been claimed, this claim included.
    pub attempts: u32,
    pub payload: serde_json::Value,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        scope: Option<JobScope>,
        attempts: u32,
        payload: serde_json::Value,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            scope,
            attempts,
            payload,
            cancel,
        }
    }

    /// Cancelled when the lease is lost. Stop side effects once it fires.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Decode the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| JobError::Failed(format!("invalid payload: {e}")))
    }
}

/// Executes one job.
///
/// With `max_concurrency > 1` the same handler runs several jobs at once, so
/// it must not share mutable state across invocations.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext) -> Result<serde_json::Value, JobError>;
}

/// Closure-backed handler, see [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap an async closure as a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, JobError>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> JobHandler for HandlerFn<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, JobError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> Result<serde_json::Value, JobError> {
        (self.f)(ctx).await
    }
}
