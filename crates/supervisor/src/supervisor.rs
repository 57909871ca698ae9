//! Supervisor: keeps every expected role running.
//!
//! ## Lifecycle
//!
//! `start()` launches one [`WorkerRuntime`] per expected role and a monitor
//! task. Each runtime gets a watcher that, on exit, removes the role's entry
//! and schedules a restart while the supervisor is still running. The
//! monitor's reconcile pass restarts missing roles, expires stale leases and
//! deletes stale worker registrations.
//!
//! ## Restarts
//!
//! At most one restart is pending per role. The delay comes from the
//! [`RestartPolicy`](crate::RestartPolicy); the failure streak resets once a
//! runtime has stayed up for `reset_after`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobmesh_core::{InstanceId, RoleKey, sleep_or_cancel};
use jobmesh_lease::{CoordinationStore, WorkerHeartbeat, WorkerStatus};
use jobmesh_worker::{RuntimeHandle, WorkerConfig, WorkerError, WorkerRuntime};

use crate::config::{SupervisorConfig, SupervisorError};
use crate::role::{RoleRegistry, RoleSource, RoleSpec};

/// A role the supervisor is currently tracking.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedRole {
    pub key: RoleKey,
    pub instance_id: InstanceId,
    pub start_time: DateTime<Utc>,
}

/// What one reconcile pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Expected roles that were missing and have been started.
    pub restarted: Vec<RoleKey>,
    /// Tracked roles that are no longer expected. Left running.
    pub unexpected: Vec<RoleKey>,
    pub expired_leases: u64,
    pub removed_workers: u64,
}

struct SupervisorEntry {
    spec: RoleSpec,
    handle: RuntimeHandle,
    abort: AbortHandle,
    start_time: DateTime<Utc>,
}

#[derive(Default)]
struct RoleTable {
    entries: HashMap<RoleKey, SupervisorEntry>,
    streaks: HashMap<RoleKey, u32>,
    pending_restart: HashSet<RoleKey>,
}

struct Inner<S> {
    store: Arc<S>,
    registry: RoleRegistry,
    source: Arc<dyn RoleSource>,
    config: SupervisorConfig,
    running: AtomicBool,
    shutdown: Mutex<CancellationToken>,
    table: Mutex<RoleTable>,
}

/// Process-local supervisor for named worker roles.
pub struct Supervisor<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for Supervisor<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: CoordinationStore> Supervisor<S> {
    pub fn new(
        store: Arc<S>,
        registry: RoleRegistry,
        source: Arc<dyn RoleSource>,
        config: SupervisorConfig,
    ) -> Result<Self, SupervisorError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                registry,
                source,
                config,
                running: AtomicBool::new(false),
                shutdown: Mutex::new(CancellationToken::new()),
                table: Mutex::new(RoleTable::default()),
            }),
        })
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start every expected role and the monitor loop. No-op if already running.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            debug!("supervisor already running");
            return;
        }

        let token = CancellationToken::new();
        *lock(&self.inner.shutdown) = token.clone();

        info!(
            monitor_interval_secs = self.inner.config.monitor_interval.as_secs(),
            "supervisor starting"
        );

        match self.inner.source.list_expected_roles().await {
            Ok(roles) => {
                for spec in roles {
                    self.inner.start_role(spec);
                }
            }
            Err(e) => warn!(error = %e, "failed to list expected roles; monitor will retry"),
        }

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.monitor(token).await });
    }

    /// Start one role unless it is already tracked. Returns `true` if a
    /// runtime was launched.
    pub fn start_role(&self, spec: RoleSpec) -> bool {
        self.inner.start_role(spec)
    }

    /// One monitoring pass.
    pub async fn reconcile(&self) -> ReconcileReport {
        self.inner.reconcile().await
    }

    /// Stop supervising: cancel every runtime cooperatively, mark tracked
    /// roles `stopped` and forget them.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("supervisor stopping");

        lock(&self.inner.shutdown).cancel();

        let entries: Vec<SupervisorEntry> = {
            let mut table = lock(&self.inner.table);
            table.pending_restart.clear();
            table.streaks.clear();
            table.entries.drain().map(|(_, entry)| entry).collect()
        };

        for entry in entries {
            entry.handle.shutdown();
            let heartbeat = WorkerHeartbeat {
                instance_id: entry.handle.instance_id(),
                role: entry.spec.key.clone(),
                status: WorkerStatus::Stopped,
                counters: entry.handle.counters(),
            };
            if let Err(e) = self.inner.store.upsert_heartbeat(&heartbeat).await {
                warn!(role = %entry.spec.key, error = %e, "failed to mark role stopped");
            }
        }

        info!("supervisor stopped");
    }

    /// Abort a role's runtime. Counts as a crash, so the role is restarted.
    pub fn terminate_role(&self, key: &RoleKey) -> bool {
        let table = lock(&self.inner.table);
        match table.entries.get(key) {
            Some(entry) => {
                warn!(role = %key, instance_id = %entry.handle.instance_id(), "terminating role");
                entry.handle.shutdown();
                entry.abort.abort();
                true
            }
            None => false,
        }
    }

    pub fn tracked_roles(&self) -> Vec<TrackedRole> {
        let table = lock(&self.inner.table);
        let mut roles: Vec<TrackedRole> = table
            .entries
            .iter()
            .map(|(key, entry)| TrackedRole {
                key: key.clone(),
                instance_id: entry.handle.instance_id(),
                start_time: entry.start_time,
            })
            .collect();
        roles.sort_by(|a, b| a.key.cmp(&b.key));
        roles
    }

    /// Control handle of a tracked role (pause, resume, counters).
    pub fn role_handle(&self, key: &RoleKey) -> Option<RuntimeHandle> {
        lock(&self.inner.table)
            .entries
            .get(key)
            .map(|entry| entry.handle.clone())
    }
}

impl<S: CoordinationStore> Inner<S> {
    fn start_role(self: &Arc<Self>, spec: RoleSpec) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            debug!(role = %spec.key, "supervisor not running; ignoring start");
            return false;
        }

        let token = lock(&self.shutdown).clone();
        let mut table = lock(&self.table);
        if table.entries.contains_key(&spec.key) {
            debug!(role = %spec.key, "role already running");
            return false;
        }

        let handler = match self.registry.build(&spec) {
            Ok(handler) => handler,
            Err(e) => {
                error!(
                    role = %spec.key,
                    role_type = %spec.role_type,
                    error = %e,
                    "failed to construct role"
                );
                drop(table);
                self.schedule_restart(spec, None);
                return false;
            }
        };

        let runtime = WorkerRuntime::new(self.store.clone(), self.worker_config(&spec))
            .with_shutdown(token.child_token());
        let handle = runtime.handle();
        let instance_id = handle.instance_id();
        let started = Instant::now();
        let task = tokio::spawn(runtime.run(handler));

        table.entries.insert(
            spec.key.clone(),
            SupervisorEntry {
                spec: spec.clone(),
                handle: handle.clone(),
                abort: task.abort_handle(),
                start_time: Utc::now(),
            },
        );
        drop(table);

        info!(role = %spec.key, instance_id = %instance_id, "role started");

        let inner = self.clone();
        tokio::spawn(async move { inner.watch_role(spec, handle, started, task).await });
        true
    }

    async fn watch_role(
        self: Arc<Self>,
        spec: RoleSpec,
        handle: RuntimeHandle,
        started: Instant,
        task: JoinHandle<Result<(), WorkerError>>,
    ) {
        let result = task.await;
        let instance_id = handle.instance_id();
        // Stops the heartbeat ticker on every exit path.
        handle.shutdown();

        let ours = {
            let mut table = lock(&self.table);
            let ours = table
                .entries
                .get(&spec.key)
                .is_some_and(|entry| entry.handle.instance_id() == instance_id);
            if ours {
                table.entries.remove(&spec.key);
            }
            ours
        };

        // Untracked already: drained by `stop()` or replaced by a newer instance.
        let running = ours && self.running.load(Ordering::SeqCst);
        match &result {
            Ok(Ok(())) if !running => {
                info!(role = %spec.key, instance_id = %instance_id, "role stopped");
                return;
            }
            Ok(Ok(())) => warn!(role = %spec.key, instance_id = %instance_id, "role exited unexpectedly"),
            Ok(Err(e)) => error!(role = %spec.key, instance_id = %instance_id, error = %e, "role failed"),
            Err(e) if e.is_cancelled() => {
                warn!(role = %spec.key, instance_id = %instance_id, "role terminated")
            }
            Err(e) => error!(role = %spec.key, instance_id = %instance_id, error = %e, "role panicked"),
        }

        if running {
            self.schedule_restart(spec, Some(started.elapsed()));
        }
    }

    fn schedule_restart(self: &Arc<Self>, spec: RoleSpec, uptime: Option<Duration>) {
        let failures = {
            let mut table = lock(&self.table);
            if !table.pending_restart.insert(spec.key.clone()) {
                debug!(role = %spec.key, "restart already pending");
                return;
            }
            let streak = table.streaks.entry(spec.key.clone()).or_insert(0);
            *streak = self.config.restart.next_streak(*streak, uptime);
            *streak
        };

        let delay = self.config.restart.delay_for(failures);
        info!(
            role = %spec.key,
            failures,
            delay_ms = delay.as_millis() as u64,
            "role restart scheduled"
        );

        let token = lock(&self.shutdown).clone();
        let inner = self.clone();
        tokio::spawn(async move {
            let elapsed = sleep_or_cancel(&token, delay).await;
            lock(&inner.table).pending_restart.remove(&spec.key);
            if elapsed && inner.running.load(Ordering::SeqCst) {
                inner.start_role(spec);
            }
        });
    }

    async fn monitor(self: Arc<Self>, token: CancellationToken) {
        loop {
            if !sleep_or_cancel(&token, self.config.monitor_interval).await {
                break;
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            let report = self.reconcile().await;
            if report != ReconcileReport::default() {
                info!(
                    restarted = report.restarted.len(),
                    unexpected = report.unexpected.len(),
                    expired_leases = report.expired_leases,
                    removed_workers = report.removed_workers,
                    "reconcile pass"
                );
            }
        }
        debug!("monitor loop stopped");
    }

    async fn reconcile(self: &Arc<Self>) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        match self.source.list_expected_roles().await {
            Ok(expected) => {
                if self.running.load(Ordering::SeqCst) {
                    for spec in &expected {
                        let missing = {
                            let table = lock(&self.table);
                            !table.entries.contains_key(&spec.key)
                                && !table.pending_restart.contains(&spec.key)
                        };
                        if missing {
                            warn!(role = %spec.key, "expected role missing; starting");
                            let key = spec.key.clone();
                            if self.start_role(spec.clone()) {
                                report.restarted.push(key);
                            }
                        }
                    }
                }

                let expected_keys: HashSet<&RoleKey> = expected.iter().map(|s| &s.key).collect();
                let table = lock(&self.table);
                report.unexpected = table
                    .entries
                    .keys()
                    .filter(|key| !expected_keys.contains(key))
                    .cloned()
                    .collect();
                report.unexpected.sort();
            }
            Err(e) => warn!(error = %e, "failed to list expected roles"),
        }

        for key in &report.unexpected {
            info!(role = %key, "role no longer expected; leaving it running");
        }

        match self.store.expire_stale_leases(self.config.global_lease_timeout).await {
            Ok(count) => {
                report.expired_leases = count;
                if count > 0 {
                    warn!(count, "reset stale leases to pending");
                }
            }
            Err(e) => error!(error = %e, "failed to expire stale leases"),
        }

        match self.store.delete_stale_workers(self.config.worker_stale_after).await {
            Ok(count) => {
                report.removed_workers = count;
                if count > 0 {
                    info!(count, "removed stale worker registrations");
                }
            }
            Err(e) => error!(error = %e, "failed to delete stale workers"),
        }

        report
    }

    fn worker_config(&self, spec: &RoleSpec) -> WorkerConfig {
        let mut config = self
            .config
            .worker_defaults
            .clone()
            .with_role(spec.key.clone())
            .with_max_concurrency(spec.max_concurrency);
        config.scope = spec.scope.clone();
        config
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}
