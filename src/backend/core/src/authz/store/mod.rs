//! Policy store contract.
//!
//! [`PolicyStore`] is the read surface consumed when a request's
//! authorization snapshot is built; [`PolicyAdmin`] is the write surface used
//! by administrative tooling. Two implementations ship with the crate:
//!
//! - [`InMemoryPolicyStore`]: copy-on-write state, readers never wait on writers
//! - [`PgPolicyStore`]: PostgreSQL via `sqlx`

use async_trait::async_trait;
use std::collections::HashSet;

use super::models::{
    Permission, PermissionId, PermissionKey, ResourcePermission, ResourcePermissionKey,
    ResourceType, Role, RoleAssignment, RoleId, TenantId, UserId,
};
use crate::error::Result;

pub mod memory;
pub mod postgres;

pub use memory::InMemoryPolicyStore;
pub use postgres::PgPolicyStore;

/// Resource permission rows matching a subject, split by tenant scope so the
/// engine can give tenant-scoped rows precedence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchedResourcePermissions {
    /// Rows whose `tenant_id` equals the subject's tenant.
    pub tenant: Vec<ResourcePermission>,
    /// Rows whose `tenant_id` is null.
    pub global: Vec<ResourcePermission>,
}

impl MatchedResourcePermissions {
    pub fn is_empty(&self) -> bool {
        self.tenant.is_empty() && self.global.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tenant.len() + self.global.len()
    }

    /// Place a row into the tenant or global bucket.
    pub fn push(&mut self, row: ResourcePermission) {
        if row.is_tenant_scoped() {
            self.tenant.push(row);
        } else {
            self.global.push(row);
        }
    }
}

/// Row-matching rule shared by every store implementation.
///
/// A row matches when its resource type is `resource_type` (or any, when
/// `None`), its tenant is the subject's tenant or global, and it targets one
/// of `role_ids` or is role-less. A role-less row with a permission applies
/// only when that permission is in `held_permissions`.
pub fn row_matches(
    row: &ResourcePermission,
    resource_type: Option<&ResourceType>,
    role_ids: &[RoleId],
    tenant_id: Option<&TenantId>,
    held_permissions: &HashSet<PermissionId>,
) -> bool {
    if let Some(resource_type) = resource_type {
        if &row.resource_type != resource_type {
            return false;
        }
    }

    let tenant_ok = match &row.tenant_id {
        None => true,
        Some(row_tenant) => tenant_id == Some(row_tenant),
    };
    if !tenant_ok {
        return false;
    }

    match (&row.role_id, &row.permission_id) {
        (Some(role_id), _) => role_ids.contains(role_id),
        (None, None) => true,
        (None, Some(permission_id)) => held_permissions.contains(permission_id),
    }
}

/// Read surface of the policy store.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Role ids held by a user through active assignments.
    async fn get_roles_for_user(&self, user_id: &UserId) -> Result<Vec<RoleId>>;

    /// Role records for the given ids. Unknown ids are skipped.
    async fn get_roles(&self, role_ids: &[RoleId]) -> Result<Vec<Role>>;

    /// Union of coarse permission keys across all given roles.
    async fn get_role_permission_keys(&self, role_ids: &[RoleId]) -> Result<HashSet<PermissionKey>>;

    /// Rows for one resource type matching the subject's roles and tenant.
    async fn get_resource_permissions(
        &self,
        resource_type: &ResourceType,
        role_ids: &[RoleId],
        tenant_id: Option<&TenantId>,
    ) -> Result<MatchedResourcePermissions>;

    /// Rows for every resource type matching the subject's roles and tenant.
    ///
    /// Used to build a per-request snapshot in a single read.
    async fn get_subject_resource_permissions(
        &self,
        role_ids: &[RoleId],
        tenant_id: Option<&TenantId>,
    ) -> Result<Vec<ResourcePermission>>;
}

/// Administrative write surface of the policy store.
#[async_trait]
pub trait PolicyAdmin: Send + Sync {
    /// Create a role. Fails with a conflict if the key or id is taken.
    async fn create_role(&self, role: Role) -> Result<Role>;

    /// Update a role's display name, super-admin flag, and tenant scope.
    async fn update_role(&self, role: Role) -> Result<Role>;

    /// Delete a role. Fails for system roles and roles still assigned.
    async fn delete_role(&self, role_id: &RoleId) -> Result<()>;

    async fn list_roles(&self) -> Result<Vec<Role>>;

    /// Add a permission to the catalog. Fails with a conflict on duplicate key.
    async fn create_permission(&self, permission: Permission) -> Result<Permission>;

    async fn update_permission(&self, permission: Permission) -> Result<Permission>;

    /// Remove a permission. Fails while any role or resource grant references it.
    async fn delete_permission(&self, permission_id: &PermissionId) -> Result<()>;

    async fn list_permissions(&self) -> Result<Vec<Permission>>;

    /// Grant a role a coarse permission. Idempotent.
    async fn assign_permission(&self, role_id: &RoleId, permission_id: &PermissionId) -> Result<()>;

    /// Returns whether the edge existed.
    async fn revoke_permission(&self, role_id: &RoleId, permission_id: &PermissionId) -> Result<bool>;

    /// Bind a user to a role, replacing any existing binding of the pair.
    async fn assign_role(&self, assignment: RoleAssignment) -> Result<()>;

    /// Returns whether the binding existed.
    async fn unassign_role(&self, user_id: &UserId, role_id: &RoleId) -> Result<bool>;

    /// Insert a resource permission, or replace the flags of the row with the
    /// same key. Serialized per key.
    async fn upsert_resource_permission(&self, row: ResourcePermission) -> Result<ResourcePermission>;

    /// Returns whether the row existed.
    async fn delete_resource_permission(&self, key: &ResourcePermissionKey) -> Result<bool>;

    async fn list_resource_permissions(&self, resource_type: &ResourceType) -> Result<Vec<ResourcePermission>>;
}
