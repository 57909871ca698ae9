//! Liveness and statistics publication.
//!
//! Reports are upserts keyed by `instance_id`. A failed report is logged and
//! dropped; losing a heartbeat must never stop job processing.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use jobmesh_core::{InstanceId, RoleKey};
use jobmesh_lease::{HeartbeatStore, WorkerHeartbeat, WorkerStatus};

use crate::stats::LiveStats;

/// Publishes a runtime's [`LiveStats`] to a [`HeartbeatStore`].
pub struct HeartbeatReporter<S: ?Sized> {
    store: Arc<S>,
    instance_id: InstanceId,
    role: RoleKey,
    stats: LiveStats,
}

impl<S: ?Sized> Clone for HeartbeatReporter<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            instance_id: self.instance_id,
            role: self.role.clone(),
            stats: self.stats.clone(),
        }
    }
}

impl<S> HeartbeatReporter<S>
where
    S: HeartbeatStore + ?Sized + 'static,
{
    pub fn new(store: Arc<S>, instance_id: InstanceId, role: RoleKey, stats: LiveStats) -> Self {
        Self {
            store,
            instance_id,
            role,
            stats,
        }
    }

    pub fn stats(&self) -> &LiveStats {
        &self.stats
    }

    /// Set the status and publish the current snapshot.
    pub async fn report(&self, status: WorkerStatus) {
        self.stats.set_status(status);
        self.publish().await;
    }

    /// Publish the current snapshot without changing status.
    pub async fn publish(&self) {
        let (status, counters) = self.stats.snapshot();
        let heartbeat = WorkerHeartbeat {
            instance_id: self.instance_id,
            role: self.role.clone(),
            status,
            counters,
        };

        match self.store.upsert_heartbeat(&heartbeat).await {
            Ok(()) => debug!(
                role = %self.role,
                instance_id = %self.instance_id,
                status = %status,
                "heartbeat published"
            ),
            Err(e) => warn!(
                role = %self.role,
                instance_id = %self.instance_id,
                error = %e,
                "heartbeat failed; dropping"
            ),
        }
    }

    /// Publish on a fixed period until `shutdown` is cancelled.
    pub fn spawn_ticker(&self, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let reporter = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => reporter.publish().await,
                }
            }
        })
    }
}
