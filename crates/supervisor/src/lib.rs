//! `jobmesh-supervisor`
//!
//! **Responsibility:** keep every expected worker role running in this process.
//!
//! - `RoleRegistry`: role type tag -> handler factory
//! - `RoleSource`: which roles should be running
//! - `Supervisor`: starts roles, restarts crashed ones, reconciles periodically

pub mod config;
pub mod restart;
pub mod role;
pub mod supervisor;

pub use config::{SupervisorConfig, SupervisorError};
pub use restart::{RestartPolicy, RestartStrategy};
pub use role::{RoleError, RoleFactory, RoleRegistry, RoleSource, RoleSpec, StaticRoleSource};
pub use supervisor::{ReconcileReport, Supervisor, TrackedRole};
