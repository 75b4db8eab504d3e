#![allow(clippy::result_large_err)]
//! # Warden Core
//!
//! Authorization resolution for multi-tenant admin applications.
//!
//! ## Architecture
//!
//! - **Authz**: roles, permission catalog, per-resource ownership and tenant
//!   grants, resolved into allow/deny decisions and listing scopes
//! - **Policy Store**: in-memory (copy-on-write) and PostgreSQL backends
//! - **Middleware**: axum layer enforcing route requirements, failing closed
//! - **Telemetry**: structured logging and decision metrics
//! - **Config**: environment and file driven configuration

pub mod authz;
pub mod config;
pub mod error;
pub mod telemetry;

pub use error::{AuthzError, ErrorCode, ErrorResponse, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::authz::{
        AuthorizationContext, Authz, Decision, IdentityContext, IdentityResolver, InMemoryPolicyStore,
        Ownership, PermissionKey, PgPolicyStore, PolicyAdmin, PolicyStore, RequireAccessLayer,
        Requirement, ResourceFlag, ResourceType, RoleId, Scope, ScopeFilter, Subject, TenantId, UserId,
    };
    pub use crate::config::{EngineConfig, WardenConfig};
    pub use crate::error::{AuthzError, ErrorCode, Result};
}
