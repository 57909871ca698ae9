//! `jobmesh-core`: shared building blocks for the coordination crates.
//!
//! Identifiers, the clock abstraction and the cancellable delay primitive live
//! here so the lease, worker and supervisor crates agree on them.

pub mod clock;
pub mod error;
pub mod id;
pub mod timer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, CoreResult};
pub use id::{InstanceId, JobId, JobScope, RoleKey, RunId};
pub use timer::sleep_or_cancel;
