//! Rolling worker statistics.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use jobmesh_lease::{WorkerCounters, WorkerStatus};

/// Counters plus a simple moving average over the most recent job durations.
#[derive(Debug, Clone)]
pub struct RollingStats {
    current_job_count: u32,
    total_processed: u64,
    total_failed: u64,
    durations: VecDeque<Duration>,
    window: usize,
}

impl RollingStats {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            current_job_count: 0,
            total_processed: 0,
            total_failed: 0,
            durations: VecDeque::with_capacity(window),
            window,
        }
    }

    pub fn set_in_flight(&mut self, count: u32) {
        self.current_job_count = count;
    }

    /// A job finished successfully.
    pub fn record_success(&mut self, duration: Duration) {
        self.total_processed += 1;
        self.finish_one(duration);
    }

    /// A job finished with a recorded failure. Failures count as processed too.
    pub fn record_failure(&mut self, duration: Duration) {
        self.total_processed += 1;
        self.total_failed += 1;
        self.finish_one(duration);
    }

    /// A job left the pool without an outcome (released or lease lost).
    pub fn record_abandoned(&mut self) {
        self.current_job_count = self.current_job_count.saturating_sub(1);
    }

    pub fn average_duration(&self) -> Duration {
        if self.durations.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.durations.iter().sum();
        total / self.durations.len() as u32
    }

    pub fn counters(&self) -> WorkerCounters {
        WorkerCounters {
            current_job_count: self.current_job_count,
            total_processed: self.total_processed,
            total_failed: self.total_failed,
            average_duration: self.average_duration(),
        }
    }

    fn finish_one(&mut self, duration: Duration) {
        self.current_job_count = self.current_job_count.saturating_sub(1);
        if self.durations.len() == self.window {
            self.durations.pop_front();
        }
        self.durations.push_back(duration);
    }
}

/// Status and statistics shared between a runtime, its heartbeat ticker and
/// its control handle.
#[derive(Debug, Clone)]
pub struct LiveStats {
    inner: Arc<Mutex<Snapshot>>,
}

#[derive(Debug)]
struct Snapshot {
    status: WorkerStatus,
    stats: RollingStats,
}

impl LiveStats {
    pub fn new(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Snapshot {
                status: WorkerStatus::Idle,
                stats: RollingStats::new(window),
            })),
        }
    }

    pub fn status(&self) -> WorkerStatus {
        self.lock().status
    }

    pub fn set_status(&self, status: WorkerStatus) {
        self.lock().status = status;
    }

    pub fn counters(&self) -> WorkerCounters {
        self.lock().stats.counters()
    }

    /// Read status and counters under one lock.
    pub fn snapshot(&self) -> (WorkerStatus, WorkerCounters) {
        let guard = self.lock();
        (guard.status, guard.stats.counters())
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut RollingStats) -> R) -> R {
        f(&mut self.lock().stats)
    }

    fn lock(&self) -> MutexGuard<'_, Snapshot> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}
