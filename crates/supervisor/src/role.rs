//! Roles: what the supervisor runs and how to build each one.
//!
//! A role type (`event-process`, `csv-process`, ...) maps to a factory in the
//! [`RoleRegistry`]. Adding a role type is one `register` call.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use jobmesh_core::{JobScope, RoleKey};
use jobmesh_worker::JobHandler;

/// Startup faults and role-source failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoleError {
    #[error("unknown role type: {0}")]
    UnknownRoleType(String),
    #[error("failed to construct role: {0}")]
    Construction(String),
    #[error("failed to list expected roles: {0}")]
    Source(String),
}

/// One logical worker role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    pub key: RoleKey,
    pub role_type: String,
    pub scope: Option<JobScope>,
    pub max_concurrency: usize,
}

impl RoleSpec {
    /// Sequential role keyed `role_type` or `role_type:scope`.
    pub fn new(role_type: impl Into<String>, scope: Option<JobScope>) -> Self {
        let role_type = role_type.into();
        Self {
            key: RoleKey::for_role(&role_type, scope.as_ref()),
            role_type,
            scope,
            max_concurrency: 1,
        }
    }

    pub fn with_key(mut self, key: RoleKey) -> Self {
        self.key = key;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }
}

/// Builds a role's handler.
pub type RoleFactory =
    Arc<dyn Fn(&RoleSpec) -> Result<Arc<dyn JobHandler>, RoleError> + Send + Sync>;

/// Role type tag -> factory.
#[derive(Clone, Default)]
pub struct RoleRegistry {
    factories: HashMap<String, RoleFactory>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, role_type: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&RoleSpec) -> Result<Arc<dyn JobHandler>, RoleError> + Send + Sync + 'static,
    {
        self.factories.insert(role_type.into(), Arc::new(factory));
        self
    }

    pub fn contains(&self, role_type: &str) -> bool {
        self.factories.contains_key(role_type)
    }

    pub fn role_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Build the handler for `spec`.
    pub fn build(&self, spec: &RoleSpec) -> Result<Arc<dyn JobHandler>, RoleError> {
        let factory = self
            .factories
            .get(&spec.role_type)
            .ok_or_else(|| RoleError::UnknownRoleType(spec.role_type.clone()))?;
        factory(spec)
    }
}

impl fmt::Debug for RoleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleRegistry")
            .field("role_types", &self.role_types())
            .finish()
    }
}

/// Source of the roles that should be running.
#[async_trait]
pub trait RoleSource: Send + Sync {
    async fn list_expected_roles(&self) -> Result<Vec<RoleSpec>, RoleError>;
}

/// A configured, in-process list of roles.
#[derive(Debug, Default)]
pub struct StaticRoleSource {
    roles: RwLock<Vec<RoleSpec>>,
}

impl StaticRoleSource {
    pub fn new(roles: Vec<RoleSpec>) -> Self {
        Self {
            roles: RwLock::new(roles),
        }
    }

    /// Replace the expected set (configuration reload).
    pub fn set_roles(&self, roles: Vec<RoleSpec>) {
        *self.roles.write().unwrap_or_else(|p| p.into_inner()) = roles;
    }
}

#[async_trait]
impl RoleSource for StaticRoleSource {
    async fn list_expected_roles(&self) -> Result<Vec<RoleSpec>, RoleError> {
        Ok(self.roles.read().unwrap_or_else(|p| p.into_inner()).clone())
    }
}
