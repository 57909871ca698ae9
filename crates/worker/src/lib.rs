//! `jobmesh-worker`: the WorkerRuntime and its collaborators.
//!
//! A [`WorkerRuntime`] claims jobs from a [`jobmesh_lease::LeaseStore`],
//! runs them through a [`JobHandler`] and reports liveness through a
//! [`HeartbeatReporter`]. Sequential mode is `max_concurrency = 1`.

pub mod config;
pub mod handler;
pub mod heartbeat;
pub mod lease_client;
pub mod run_record;
pub mod runtime;
pub mod stats;

pub use config::{WorkerConfig, WorkerError};
pub use handler::{HandlerFn, JobContext, JobError, JobHandler, handler_fn};
pub use heartbeat::HeartbeatReporter;
pub use lease_client::{JobOutcome, LeaseClient};
pub use runtime::{RuntimeHandle, RuntimeState, WorkerRuntime};
pub use stats::{LiveStats, RollingStats};
