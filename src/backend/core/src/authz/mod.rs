//! Multi-tenant authorization: coarse role permissions plus per-resource
//! ownership and tenant-aware grants.
//!
//! This module provides:
//! - **Models**: roles, the permission catalog, assignments, resource flags
//! - **Policy Store**: read and admin contracts, in-memory and PostgreSQL backends
//! - **Engine**: pure resolution of capabilities, resource flags, and scopes
//! - **Context**: request-scoped snapshot answering every question consistently
//! - **Identity**: turns the session's identity into a resolved subject
//! - **Middleware**: axum layer and extractor enforcing route requirements
//!
//! # Usage
//!
//! ```rust,ignore
//! use warden_core::authz::{AuthorizationContext, IdentityContext, Ownership};
//!
//! let identity = IdentityContext::new("u1").in_tenant("5");
//! let ctx = AuthorizationContext::establish_or_deny(store, &identity, &config.engine).await;
//!
//! if ctx.can("manage_themes") { /* ... */ }
//! let filter = ctx.scope_filter("jobs");
//! let editable = ctx.can_edit("jobs", Ownership::of(ctx.subject(), job.owner_id.as_ref()));
//! ```

pub mod builtin;
pub mod context;
pub mod engine;
pub mod identity;
pub mod middleware;
pub mod models;
pub mod scope;
pub mod store;

pub use builtin::{bootstrap, BuiltinRole};
pub use context::{AuthorizationContext, PolicySnapshot};
pub use engine::{Decision, GrantTier};
pub use identity::{IdentityContext, IdentityResolver, Ownership, Subject};
pub use middleware::{Authz, RequireAccessLayer, RequireAccessService, Requirement};
pub use models::{
    Permission, PermissionId, PermissionKey, ResourceFlag, ResourceFlags, ResourcePermission,
    ResourcePermissionKey, ResourceType, Role, RoleAssignment, RoleId, RoleKey, RolePermission,
    TenantId, UserId,
};
pub use scope::{Scope, ScopeFilter};
pub use store::{
    InMemoryPolicyStore, MatchedResourcePermissions, PgPolicyStore, PolicyAdmin, PolicyStore,
};
