//! In-process policy store.
//!
//! State is immutable once published: writers serialize on a mutex, build the
//! next state from a clone, and swap the `Arc`. Readers only clone the current
//! `Arc`, so an in-progress write never blocks them and every read within one
//! call observes a single consistent state.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use super::{row_matches, MatchedResourcePermissions, PolicyAdmin, PolicyStore};
use crate::authz::models::{
    Permission, PermissionId, PermissionKey, ResourcePermission, ResourcePermissionKey,
    ResourceType, Role, RoleAssignment, RoleId, TenantId, UserId,
};
use crate::error::{AuthzError, Result};

#[derive(Debug, Clone, Default)]
struct PolicyState {
    roles: HashMap<RoleId, Role>,
    permissions: HashMap<PermissionId, Permission>,
    /// Role id -> granted permission ids.
    role_permissions: HashMap<RoleId, HashSet<PermissionId>>,
    /// (user, role) -> assignment.
    assignments: HashMap<(UserId, RoleId), RoleAssignment>,
    resource_permissions: HashMap<ResourcePermissionKey, ResourcePermission>,
}

impl PolicyState {
    fn held_permissions(&self, role_ids: &[RoleId]) -> HashSet<PermissionId> {
        role_ids
            .iter()
            .filter_map(|role_id| self.role_permissions.get(role_id))
            .flatten()
            .cloned()
            .collect()
    }

    fn require_role(&self, role_id: &RoleId) -> Result<&Role> {
        self.roles
            .get(role_id)
            .ok_or_else(|| AuthzError::not_found("role", role_id.as_str()))
    }

    fn require_permission(&self, permission_id: &PermissionId) -> Result<&Permission> {
        self.permissions
            .get(permission_id)
            .ok_or_else(|| AuthzError::not_found("permission", permission_id.as_str()))
    }

    fn role_key_taken(&self, role: &Role) -> bool {
        self.roles
            .values()
            .any(|existing| existing.key == role.key && existing.id != role.id)
    }

    fn permission_key_taken(&self, permission: &Permission) -> bool {
        self.permissions
            .values()
            .any(|existing| existing.key == permission.key && existing.id != permission.id)
    }

    fn has_rows_outside_tenant(&self, role_id: &RoleId, tenant_id: &TenantId) -> bool {
        self.resource_permissions.values().any(|row| {
            row.role_id.as_ref() == Some(role_id)
                && row.tenant_id.as_ref().is_some_and(|row_tenant| row_tenant != tenant_id)
        })
    }

    fn matching_rows<'a>(
        &'a self,
        resource_type: Option<&'a ResourceType>,
        role_ids: &'a [RoleId],
        tenant_id: Option<&'a TenantId>,
    ) -> impl Iterator<Item = &'a ResourcePermission> + 'a {
        let held = self.held_permissions(role_ids);
        self.resource_permissions
            .values()
            .filter(move |row| row_matches(row, resource_type, role_ids, tenant_id, &held))
    }
}

/// Policy store held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    state: RwLock<Arc<PolicyState>>,
    write_lock: Mutex<()>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Arc<PolicyState> {
        self.state.read().clone()
    }

    /// Apply a write against a private copy and publish it on success.
    fn mutate<T>(&self, apply: impl FnOnce(&mut PolicyState) -> Result<T>) -> Result<T> {
        let _guard = self.write_lock.lock();
        let mut next = PolicyState::clone(&self.snapshot());
        let out = apply(&mut next)?;
        *self.state.write() = Arc::new(next);
        Ok(out)
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn get_roles_for_user(&self, user_id: &UserId) -> Result<Vec<RoleId>> {
        let state = self.snapshot();
        let now = Utc::now();
        let mut active: Vec<&RoleAssignment> = state
            .assignments
            .values()
            .filter(|a| &a.user_id == user_id && a.is_active_at(now))
            .filter(|a| state.roles.contains_key(&a.role_id))
            .collect();
        active.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.role_id.cmp(&b.role_id))
        });
        Ok(active.into_iter().map(|a| a.role_id.clone()).collect())
    }

    async fn get_roles(&self, role_ids: &[RoleId]) -> Result<Vec<Role>> {
        let state = self.snapshot();
        Ok(role_ids
            .iter()
            .filter_map(|id| state.roles.get(id).cloned())
            .collect())
    }

    async fn get_role_permission_keys(&self, role_ids: &[RoleId]) -> Result<HashSet<PermissionKey>> {
        let state = self.snapshot();
        Ok(state
            .held_permissions(role_ids)
            .iter()
            .filter_map(|id| state.permissions.get(id))
            .map(|p| p.key.clone())
            .collect())
    }

    async fn get_resource_permissions(
        &self,
        resource_type: &ResourceType,
        role_ids: &[RoleId],
        tenant_id: Option<&TenantId>,
    ) -> Result<MatchedResourcePermissions> {
        let state = self.snapshot();
        let mut matched = MatchedResourcePermissions::default();
        for row in state.matching_rows(Some(resource_type), role_ids, tenant_id) {
            matched.push(row.clone());
        }
        Ok(matched)
    }

    async fn get_subject_resource_permissions(
        &self,
        role_ids: &[RoleId],
        tenant_id: Option<&TenantId>,
    ) -> Result<Vec<ResourcePermission>> {
        let state = self.snapshot();
        Ok(state
            .matching_rows(None, role_ids, tenant_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PolicyAdmin for InMemoryPolicyStore {
    async fn create_role(&self, role: Role) -> Result<Role> {
        self.mutate(|state| {
            if state.roles.contains_key(&role.id) || state.role_key_taken(&role) {
                return Err(AuthzError::conflict(format!("role already exists: {}", role.key)));
            }
            debug!(role_id = %role.id, role_key = %role.key, "Creating role");
            state.roles.insert(role.id.clone(), role.clone());
            Ok(role)
        })
    }

    async fn update_role(&self, role: Role) -> Result<Role> {
        self.mutate(|state| {
            let existing = state.require_role(&role.id)?.clone();
            if state.role_key_taken(&role) {
                return Err(AuthzError::conflict(format!("role key already in use: {}", role.key)));
            }
            if let Some(tenant_id) = &role.tenant_id {
                if state.has_rows_outside_tenant(&role.id, tenant_id) {
                    return Err(AuthzError::validation(format!(
                        "role {} still has resource permissions in another tenant",
                        role.key
                    )));
                }
            }
            let updated = Role {
                is_system: existing.is_system,
                created_at: existing.created_at,
                updated_at: Utc::now(),
                ..role
            };
            debug!(role_id = %updated.id, "Updating role");
            state.roles.insert(updated.id.clone(), updated.clone());
            Ok(updated)
        })
    }

    async fn delete_role(&self, role_id: &RoleId) -> Result<()> {
        self.mutate(|state| {
            let role = state.require_role(role_id)?;
            if role.is_system {
                return Err(AuthzError::conflict(format!("cannot delete system role: {}", role.key)));
            }
            if state.assignments.keys().any(|(_, assigned)| assigned == role_id) {
                return Err(AuthzError::conflict(format!(
                    "role is still assigned to users: {}",
                    role.key
                )));
            }
            debug!(role_id = %role_id, "Deleting role");
            state.roles.remove(role_id);
            state.role_permissions.remove(role_id);
            state
                .resource_permissions
                .retain(|key, _| key.role_id.as_ref() != Some(role_id));
            Ok(())
        })
    }

    async fn list_roles(&self) -> Result<Vec<Role>> {
        let mut roles: Vec<Role> = self.snapshot().roles.values().cloned().collect();
        roles.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(roles)
    }

    async fn create_permission(&self, permission: Permission) -> Result<Permission> {
        self.mutate(|state| {
            if state.permissions.contains_key(&permission.id) || state.permission_key_taken(&permission) {
                return Err(AuthzError::conflict(format!(
                    "permission already exists: {}",
                    permission.key
                )));
            }
            debug!(permission_key = %permission.key, "Creating permission");
            state.permissions.insert(permission.id.clone(), permission.clone());
            Ok(permission)
        })
    }

    async fn update_permission(&self, permission: Permission) -> Result<Permission> {
        self.mutate(|state| {
            state.require_permission(&permission.id)?;
            if state.permission_key_taken(&permission) {
                return Err(AuthzError::conflict(format!(
                    "permission key already in use: {}",
                    permission.key
                )));
            }
            state.permissions.insert(permission.id.clone(), permission.clone());
            Ok(permission)
        })
    }

    async fn delete_permission(&self, permission_id: &PermissionId) -> Result<()> {
        self.mutate(|state| {
            let permission = state.require_permission(permission_id)?;
            let granted = state
                .role_permissions
                .values()
                .any(|ids| ids.contains(permission_id));
            let referenced = state
                .resource_permissions
                .keys()
                .any(|key| key.permission_id.as_ref() == Some(permission_id));
            if granted || referenced {
                return Err(AuthzError::conflict(format!(
                    "permission is still referenced: {}",
                    permission.key
                )));
            }
            state.permissions.remove(permission_id);
            Ok(())
        })
    }

    async fn list_permissions(&self) -> Result<Vec<Permission>> {
        let mut permissions: Vec<Permission> = self.snapshot().permissions.values().cloned().collect();
        permissions.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(permissions)
    }

    async fn assign_permission(&self, role_id: &RoleId, permission_id: &PermissionId) -> Result<()> {
        self.mutate(|state| {
            state.require_role(role_id)?;
            state.require_permission(permission_id)?;
            state
                .role_permissions
                .entry(role_id.clone())
                .or_default()
                .insert(permission_id.clone());
            Ok(())
        })
    }

    async fn revoke_permission(&self, role_id: &RoleId, permission_id: &PermissionId) -> Result<bool> {
        self.mutate(|state| {
            Ok(state
                .role_permissions
                .get_mut(role_id)
                .map_or(false, |ids| ids.remove(permission_id)))
        })
    }

    async fn assign_role(&self, assignment: RoleAssignment) -> Result<()> {
        self.mutate(|state| {
            state.require_role(&assignment.role_id)?;
            debug!(
                user_id = %assignment.user_id,
                role_id = %assignment.role_id,
                "Assigning role"
            );
            let key = (assignment.user_id.clone(), assignment.role_id.clone());
            state.assignments.insert(key, assignment);
            Ok(())
        })
    }

    async fn unassign_role(&self, user_id: &UserId, role_id: &RoleId) -> Result<bool> {
        self.mutate(|state| {
            Ok(state
                .assignments
                .remove(&(user_id.clone(), role_id.clone()))
                .is_some())
        })
    }

    async fn upsert_resource_permission(&self, row: ResourcePermission) -> Result<ResourcePermission> {
        self.mutate(|state| {
            if let Some(role_id) = &row.role_id {
                let role = state.require_role(role_id)?;
                if let (Some(role_tenant), Some(row_tenant)) = (&role.tenant_id, &row.tenant_id) {
                    if role_tenant != row_tenant {
                        return Err(AuthzError::validation(format!(
                            "role {} belongs to another tenant",
                            role.key
                        )));
                    }
                }
            }
            if let Some(permission_id) = &row.permission_id {
                state.require_permission(permission_id)?;
            }
            debug!(
                resource_type = %row.resource_type,
                role_id = ?row.role_id,
                tenant_id = ?row.tenant_id,
                "Upserting resource permission"
            );
            state.resource_permissions.insert(row.key(), row.clone());
            Ok(row)
        })
    }

    async fn delete_resource_permission(&self, key: &ResourcePermissionKey) -> Result<bool> {
        self.mutate(|state| Ok(state.resource_permissions.remove(key).is_some()))
    }

    async fn list_resource_permissions(&self, resource_type: &ResourceType) -> Result<Vec<ResourcePermission>> {
        let state = self.snapshot();
        let mut rows: Vec<ResourcePermission> = state
            .resource_permissions
            .values()
            .filter(|row| &row.resource_type == resource_type)
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (&a.tenant_id, &a.role_id, &a.permission_id).cmp(&(&b.tenant_id, &b.role_id, &b.permission_id))
        });
        Ok(rows)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::models::{ResourceFlag, RoleKey};
    use crate::error::ErrorCode;

    fn role(key: &str) -> Role {
        Role::new(RoleKey::parse(key).unwrap(), key).with_id(RoleId::new(key))
    }

    fn permission(key: &str) -> Permission {
        Permission::new(PermissionKey::parse(key).unwrap(), key).with_id(PermissionId::new(key))
    }

    fn jobs() -> ResourceType {
        ResourceType::parse("jobs").unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_role_key_conflicts() {
        let store = InMemoryPolicyStore::new();
        store.create_role(role("editor")).await.unwrap();

        let dup = Role::new(RoleKey::parse("editor").unwrap(), "Another editor");
        let err = store.create_role(dup).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConflictError);
        assert_eq!(store.list_roles().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_permission_key_conflicts() {
        let store = InMemoryPolicyStore::new();
        store.create_permission(permission("manage_themes")).await.unwrap();

        let dup = Permission::new(PermissionKey::parse("manage_themes").unwrap(), "dup");
        let err = store.create_permission(dup).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConflictError);
    }

    #[tokio::test]
    async fn test_role_permission_keys_are_unioned() {
        let store = InMemoryPolicyStore::new();
        store.create_role(role("editor")).await.unwrap();
        store.create_role(role("auditor")).await.unwrap();
        store.create_permission(permission("manage_themes")).await.unwrap();
        store.create_permission(permission("certificates_audits.manage")).await.unwrap();
        store
            .assign_permission(&RoleId::new("editor"), &PermissionId::new("manage_themes"))
            .await
            .unwrap();
        store
            .assign_permission(
                &RoleId::new("auditor"),
                &PermissionId::new("certificates_audits.manage"),
            )
            .await
            .unwrap();

        let keys = store
            .get_role_permission_keys(&[RoleId::new("editor"), RoleId::new("auditor")])
            .await
            .unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&PermissionKey::parse("manage_themes").unwrap()));

        assert!(store
            .revoke_permission(&RoleId::new("editor"), &PermissionId::new("manage_themes"))
            .await
            .unwrap());
        let keys = store
            .get_role_permission_keys(&[RoleId::new("editor")])
            .await
            .unwrap();
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn test_assigned_role_cannot_be_deleted() {
        let store = InMemoryPolicyStore::new();
        store.create_role(role("editor")).await.unwrap();
        store
            .assign_role(RoleAssignment::new(UserId::new("u1"), RoleId::new("editor")))
            .await
            .unwrap();

        let err = store.delete_role(&RoleId::new("editor")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConflictError);

        store
            .unassign_role(&UserId::new("u1"), &RoleId::new("editor"))
            .await
            .unwrap();
        store.delete_role(&RoleId::new("editor")).await.unwrap();
        assert!(store.list_roles().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_system_role_cannot_be_deleted() {
        let store = InMemoryPolicyStore::new();
        store.create_role(role("super_admin").system()).await.unwrap();
        let err = store.delete_role(&RoleId::new("super_admin")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConflictError);
    }

    #[tokio::test]
    async fn test_update_role_preserves_system_flag() {
        let store = InMemoryPolicyStore::new();
        store.create_role(role("super_admin").system()).await.unwrap();
        let mut renamed = role("super_admin");
        renamed.name = "Root".to_string();
        let updated = store.update_role(renamed).await.unwrap();
        assert!(updated.is_system);
        assert_eq!(updated.name, "Root");
    }

    #[tokio::test]
    async fn test_referenced_permission_cannot_be_deleted() {
        let store = InMemoryPolicyStore::new();
        store.create_permission(permission("manage_jobs")).await.unwrap();
        store
            .upsert_resource_permission(
                ResourcePermission::new(jobs()).for_permission(PermissionId::new("manage_jobs")),
            )
            .await
            .unwrap();

        let err = store
            .delete_permission(&PermissionId::new("manage_jobs"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConflictError);
    }

    #[tokio::test]
    async fn test_expired_assignments_are_ignored() {
        let store = InMemoryPolicyStore::new();
        store.create_role(role("editor")).await.unwrap();
        store.create_role(role("viewer")).await.unwrap();
        store
            .assign_role(RoleAssignment::new(UserId::new("u1"), RoleId::new("editor")))
            .await
            .unwrap();
        store
            .assign_role(
                RoleAssignment::new(UserId::new("u1"), RoleId::new("viewer"))
                    .with_expiry(Utc::now() - chrono::Duration::minutes(5)),
            )
            .await
            .unwrap();

        let roles = store.get_roles_for_user(&UserId::new("u1")).await.unwrap();
        assert_eq!(roles, vec![RoleId::new("editor")]);
    }

    #[tokio::test]
    async fn test_upsert_replaces_flags_for_same_key() {
        let store = InMemoryPolicyStore::new();
        store.create_role(role("editor")).await.unwrap();

        let row = ResourcePermission::new(jobs())
            .for_role(RoleId::new("editor"))
            .grant(ResourceFlag::ViewOwn);
        store.upsert_resource_permission(row.clone()).await.unwrap();
        store
            .upsert_resource_permission(row.grant(ResourceFlag::Create))
            .await
            .unwrap();

        let rows = store.list_resource_permissions(&jobs()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].flags.get(ResourceFlag::Create));
        assert!(rows[0].flags.get(ResourceFlag::ViewOwn));
    }

    #[tokio::test]
    async fn test_upsert_rejects_unknown_role_and_foreign_tenant() {
        let store = InMemoryPolicyStore::new();
        let err = store
            .upsert_resource_permission(ResourcePermission::new(jobs()).for_role(RoleId::new("ghost")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RecordNotFound);

        store
            .create_role(role("tenant_editor").with_tenant(TenantId::new("5")))
            .await
            .unwrap();
        let err = store
            .upsert_resource_permission(
                ResourcePermission::new(jobs())
                    .for_role(RoleId::new("tenant_editor"))
                    .in_tenant(TenantId::new("6")),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn test_upsert_rejects_unknown_permission() {
        let store = InMemoryPolicyStore::new();
        let err = store
            .upsert_resource_permission(
                ResourcePermission::new(jobs()).for_permission(PermissionId::new("ghost")),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RecordNotFound);
        assert!(store.list_resource_permissions(&jobs()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_role_cannot_move_away_from_its_tenant_rows() {
        let store = InMemoryPolicyStore::new();
        store.create_role(role("editor")).await.unwrap();
        store
            .upsert_resource_permission(
                ResourcePermission::new(jobs())
                    .for_role(RoleId::new("editor"))
                    .in_tenant(TenantId::new("5"))
                    .grant(ResourceFlag::ViewAll),
            )
            .await
            .unwrap();

        let err = store
            .update_role(role("editor").with_tenant(TenantId::new("6")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        let roles = store.get_roles(&[RoleId::new("editor")]).await.unwrap();
        assert_eq!(roles[0].tenant_id, None);

        let updated = store
            .update_role(role("editor").with_tenant(TenantId::new("5")))
            .await
            .unwrap();
        assert_eq!(updated.tenant_id, Some(TenantId::new("5")));
    }

    #[tokio::test]
    async fn test_resource_permissions_partitioned_by_tenant() {
        let store = InMemoryPolicyStore::new();
        store.create_role(role("editor")).await.unwrap();
        let base = ResourcePermission::new(jobs()).for_role(RoleId::new("editor"));
        store.upsert_resource_permission(base.clone()).await.unwrap();
        store
            .upsert_resource_permission(base.clone().in_tenant(TenantId::new("5")))
            .await
            .unwrap();
        store
            .upsert_resource_permission(base.in_tenant(TenantId::new("6")))
            .await
            .unwrap();

        let matched = store
            .get_resource_permissions(&jobs(), &[RoleId::new("editor")], Some(&TenantId::new("5")))
            .await
            .unwrap();
        assert_eq!(matched.tenant.len(), 1);
        assert_eq!(matched.global.len(), 1);

        let all = store
            .get_subject_resource_permissions(&[RoleId::new("editor")], Some(&TenantId::new("5")))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_write_publishes_nothing() {
        let store = InMemoryPolicyStore::new();
        let before = store.snapshot();
        let err = store
            .assign_permission(&RoleId::new("ghost"), &PermissionId::new("none"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RecordNotFound);
        assert!(Arc::ptr_eq(&before, &store.snapshot()));
    }

    #[tokio::test]
    async fn test_readers_keep_their_snapshot_across_writes() {
        let store = InMemoryPolicyStore::new();
        let before = store.snapshot();
        store.create_role(role("editor")).await.unwrap();
        assert!(before.roles.is_empty());
        assert_eq!(store.snapshot().roles.len(), 1);
    }
}
