//! WorkerRuntime: claim, execute, report, repeat.
//!
//! Each cycle claims up to `max_concurrency` jobs, runs them as tasks in a
//! `JoinSet` and waits for the whole batch to settle before claiming again.
//! While a handler runs, its lease is renewed every `renew_interval`; a failed
//! renewal cancels the job and nothing is written for it.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobmesh_core::{InstanceId, JobId, RoleKey, sleep_or_cancel};
use jobmesh_lease::{CoordinationStore, JobLease, StoreError, WorkerCounters, WorkerStatus};

use crate::config::{WorkerConfig, WorkerError};
use crate::handler::{JobContext, JobError, JobHandler};
use crate::heartbeat::HeartbeatReporter;
use crate::lease_client::{JobOutcome, LeaseClient};
use crate::run_record;
use crate::stats::LiveStats;

/// Lifecycle state of one runtime instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Starting,
    Idle,
    Processing,
    Paused,
    /// Transient: the runtime backs off and tries again.
    Error,
    Stopped,
}

impl RuntimeState {
    pub fn worker_status(&self) -> WorkerStatus {
        match self {
            RuntimeState::Starting | RuntimeState::Idle => WorkerStatus::Idle,
            RuntimeState::Processing => WorkerStatus::Processing,
            RuntimeState::Paused => WorkerStatus::Paused,
            RuntimeState::Error => WorkerStatus::Error,
            RuntimeState::Stopped => WorkerStatus::Stopped,
        }
    }
}

/// Control and introspection for a running [`WorkerRuntime`].
#[derive(Debug, Clone)]
pub struct RuntimeHandle {
    instance_id: InstanceId,
    role: RoleKey,
    shutdown: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
    state: watch::Receiver<RuntimeState>,
    stats: LiveStats,
}

impl RuntimeHandle {
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn role(&self) -> &RoleKey {
        &self.role
    }

    /// Request cooperative shutdown. In-flight jobs finish first.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop claiming new work after the current cycle.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn state(&self) -> RuntimeState {
        *self.state.borrow()
    }

    /// Wait until the runtime reaches `target`.
    pub async fn wait_for_state(&self, target: RuntimeState) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == target).await;
    }

    pub fn counters(&self) -> WorkerCounters {
        self.stats.counters()
    }
}

/// A single worker process serving one role.
pub struct WorkerRuntime<S> {
    store: Arc<S>,
    config: WorkerConfig,
    instance_id: InstanceId,
    shutdown: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
    state: watch::Sender<RuntimeState>,
    stats: LiveStats,
}

impl<S: CoordinationStore> WorkerRuntime<S> {
    pub fn new(store: Arc<S>, config: WorkerConfig) -> Self {
        let (paused, _) = watch::channel(false);
        let (state, _) = watch::channel(RuntimeState::Starting);
        let stats = LiveStats::new(config.duration_window);
        Self {
            store,
            config,
            instance_id: InstanceId::new(),
            shutdown: CancellationToken::new(),
            paused: Arc::new(paused),
            state,
            stats,
        }
    }

    /// Stop when `token` is cancelled (e.g. a supervisor's child token).
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            instance_id: self.instance_id,
            role: self.config.role.clone(),
            shutdown: self.shutdown.clone(),
            paused: self.paused.clone(),
            state: self.state.subscribe(),
            stats: self.stats.clone(),
        }
    }

    /// Run until shutdown is requested.
    ///
    /// Only an invalid configuration is an error; job failures, lost leases
    /// and store outages are handled inside the loop.
    pub async fn run(self, handler: Arc<dyn JobHandler>) -> Result<(), WorkerError> {
        self.config.validate()?;

        let reporter = HeartbeatReporter::new(
            self.store.clone(),
            self.instance_id,
            self.config.role.clone(),
            self.stats.clone(),
        );

        info!(
            role = %self.config.role,
            instance_id = %self.instance_id,
            max_concurrency = self.config.max_concurrency,
            "worker runtime started"
        );

        let ticker = reporter.spawn_ticker(self.config.heartbeat_interval, self.shutdown.clone());
        let mut paused = self.paused.subscribe();

        while !self.shutdown.is_cancelled() {
            if *paused.borrow_and_update() {
                self.set_state(RuntimeState::Paused);
                reporter.report(WorkerStatus::Paused).await;
                info!(role = %self.config.role, instance_id = %self.instance_id, "worker runtime paused");

                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = wait_resumed(&mut paused) => {}
                }

                info!(role = %self.config.role, instance_id = %self.instance_id, "worker runtime resumed");
                continue;
            }

            self.run_cycle(&handler, &reporter).await;
        }

        let _ = ticker.await;

        self.set_state(RuntimeState::Stopped);
        self.stats.update(|s| s.set_in_flight(0));
        reporter.report(WorkerStatus::Stopped).await;

        info!(role = %self.config.role, instance_id = %self.instance_id, "worker runtime stopped");
        Ok(())
    }

    async fn run_cycle(&self, handler: &Arc<dyn JobHandler>, reporter: &HeartbeatReporter<S>) {
        let (claimed, claim_error) = self.claim_batch().await;

        if claimed.is_empty() {
            match claim_error {
                Some(e) => {
                    error!(
                        role = %self.config.role,
                        instance_id = %self.instance_id,
                        error = %e,
                        backoff_ms = self.config.error_backoff.as_millis() as u64,
                        "failed to claim jobs; backing off"
                    );
                    self.set_state(RuntimeState::Error);
                    reporter.report(WorkerStatus::Error).await;
                    sleep_or_cancel(&self.shutdown, self.config.error_backoff).await;
                }
                None => {
                    debug!(role = %self.config.role, "no jobs available");
                    self.set_state(RuntimeState::Idle);
                    reporter.report(WorkerStatus::Idle).await;
                    sleep_or_cancel(&self.shutdown, self.config.idle_interval).await;
                }
            }
            return;
        }

        if let Some(e) = claim_error {
            warn!(
                role = %self.config.role,
                claimed = claimed.len(),
                error = %e,
                "claim failed mid-batch; running the jobs already claimed"
            );
        }

        self.process_batch(claimed, handler, reporter).await;
    }

    async fn claim_batch(&self) -> (Vec<JobLease>, Option<StoreError>) {
        let mut claimed = Vec::new();
        while claimed.len() < self.config.max_concurrency {
            match self
                .store
                .claim_next(self.instance_id, self.config.scope.as_ref(), self.config.lease_timeout)
                .await
            {
                Ok(Some(job)) => claimed.push(job),
                Ok(None) => break,
                Err(e) => return (claimed, Some(e)),
            }
        }
        (claimed, None)
    }

    async fn process_batch(
        &self,
        claimed: Vec<JobLease>,
        handler: &Arc<dyn JobHandler>,
        reporter: &HeartbeatReporter<S>,
    ) {
        let count = claimed.len() as u32;
        self.set_state(RuntimeState::Processing);
        self.stats.update(|s| s.set_in_flight(count));
        reporter.report(WorkerStatus::Processing).await;

        let run_id = run_record::begin_run(
            self.store.as_ref(),
            self.config.role.as_str(),
            self.instance_id,
            count,
        )
        .await;

        let client = LeaseClient::new(
            self.store.clone(),
            self.instance_id,
            self.config.role.clone(),
            self.config.lease_timeout,
        );
        let renew_every = self.config.effective_renew_interval();

        let mut in_flight = JoinSet::new();
        for job in claimed {
            in_flight.spawn(execute(client.clone(), handler.clone(), job, renew_every));
        }

        let mut jobs_failed = 0u32;
        let mut first_error: Option<String> = None;

        while let Some(joined) = in_flight.join_next().await {
            let (job_id, elapsed, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(role = %self.config.role, error = %e, "job task ended abnormally");
                    self.stats.update(|s| s.record_abandoned());
                    jobs_failed += 1;
                    first_error.get_or_insert_with(|| format!("job task ended abnormally: {e}"));
                    reporter.publish().await;
                    continue;
                }
            };

            match &outcome {
                JobOutcome::Completed => {
                    debug!(role = %self.config.role, job_id = %job_id, elapsed_ms = elapsed.as_millis() as u64, "job completed");
                    self.stats.update(|s| s.record_success(elapsed));
                }
                JobOutcome::Failed(msg) => {
                    warn!(role = %self.config.role, job_id = %job_id, error = %msg, "job failed");
                    self.stats.update(|s| s.record_failure(elapsed));
                }
                JobOutcome::Released(reason) => {
                    info!(role = %self.config.role, job_id = %job_id, reason = %reason, "job released");
                    self.stats.update(|s| s.record_abandoned());
                }
                JobOutcome::LeaseLost | JobOutcome::WriteFailed(_) => {
                    self.stats.update(|s| s.record_abandoned());
                }
            }

            if let Some(msg) = outcome.failure() {
                jobs_failed += 1;
                first_error.get_or_insert_with(|| msg.to_string());
            }

            reporter.publish().await;
        }

        run_record::finish_run(
            self.store.as_ref(),
            run_id,
            run_record::cycle_outcome(jobs_failed, first_error),
        )
        .await;
    }

    fn set_state(&self, state: RuntimeState) {
        self.state.send_replace(state);
    }
}

async fn wait_resumed(paused: &mut watch::Receiver<bool>) {
    let _ = paused.wait_for(|p| !*p).await;
}

/// Run one job under its lease. Returns the job id, handler time and outcome.
async fn execute<S>(
    client: LeaseClient<S>,
    handler: Arc<dyn JobHandler>,
    job: JobLease,
    renew_every: Duration,
) -> (JobId, Duration, JobOutcome)
where
    S: CoordinationStore,
{
    let JobLease {
        id: job_id,
        scope,
        payload,
        attempts,
        ..
    } = job;

    let started = Instant::now();
    let cancel = CancellationToken::new();
    let ctx = JobContext::new(job_id, scope, attempts, payload, cancel.clone());

    debug!(job_id = %job_id, attempts, "job started");

    // The handler never outlives this future.
    let cancel_on_drop = cancel.drop_guard();
    let mut task = AbortOnDrop(tokio::spawn(async move { handler.handle(ctx).await }));
    let mut renew = tokio::time::interval_at(started + renew_every, renew_every);
    renew.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let joined = loop {
        tokio::select! {
            joined = &mut task.0 => break joined,
            _ = renew.tick() => match client.renew(job_id).await {
                Ok(true) => debug!(job_id = %job_id, "lease renewed"),
                Ok(false) => {
                    warn!(
                        job_id = %job_id,
                        instance_id = %client.instance_id(),
                        "lease lost; cancelling job"
                    );
                    return (job_id, started.elapsed(), JobOutcome::LeaseLost);
                }
                Err(e) => warn!(
                    job_id = %job_id,
                    error = %e,
                    "lease renewal failed; retrying on next tick"
                ),
            },
        }
    };

    cancel_on_drop.disarm();

    let elapsed = started.elapsed();
    let outcome = match joined {
        Ok(Ok(result)) => client.complete(job_id, result).await,
        Ok(Err(JobError::Failed(msg))) => client.fail(job_id, msg).await,
        Ok(Err(JobError::NotReady(reason))) => client.release(job_id, reason).await,
        Err(e) => client.fail(job_id, join_failure(e)).await,
    };

    (job_id, elapsed, outcome)
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn join_failure(err: JoinError) -> String {
    if !err.is_panic() {
        return "handler task was cancelled".to_string();
    }
    match panic_text(err.into_panic()) {
        Some(msg) => format!("handler panicked: {msg}"),
        None => "handler panicked".to_string(),
    }
}

fn panic_text(payload: Box<dyn Any + Send>) -> Option<String> {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return Some((*s).to_string());
    }
    payload.downcast_ref::<String>().cloned()
}
