//! `jobmesh-lease`
//!
//! **Responsibility:** the lease protocol and its storage ports.
//!
//! - `JobLease`: one unit of work plus its lease state
//! - `LeaseStore`: atomic claim / renew / complete / fail / release
//! - `HeartbeatStore`: worker registrations keyed by instance id
//! - `RunLog`: per-cycle audit records
//!
//! Two backends are provided: `InMemoryStore` (tests/dev) and `PostgresStore`.

pub mod in_memory;
pub mod postgres;
pub mod registration;
pub mod store;
pub mod types;

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use registration::{
    RunOutcome, RunRecord, RunStatus, WorkerCounters, WorkerHeartbeat, WorkerRegistration,
    WorkerStatus,
};
pub use store::{CoordinationStore, HeartbeatStore, JobStats, LeaseStore, RunLog, StoreError};
pub use types::{JobLease, JobStatus, NewJob};
