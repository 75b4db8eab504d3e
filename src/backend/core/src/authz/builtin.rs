//! Built-in roles and policy bootstrap.
//!
//! Three system roles ship with the engine:
//!
//! | Role        | Resource flags granted on every bootstrapped type         |
//! |-------------|-----------------------------------------------------------|
//! | super_admin | none needed, holders bypass every check                   |
//! | editor      | view_own, create, edit_own, delete_own                    |
//! | viewer      | view_tenant                                               |
//!
//! Built-in rows are global. Tenants refine them with tenant-scoped rows.

use tracing::info;

use super::models::{ResourceFlag, ResourceFlags, ResourcePermission, ResourceType, Role, RoleId, RoleKey};
use super::store::PolicyAdmin;
use crate::error::{AuthzError, Result};

/// Built-in role templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinRole {
    SuperAdmin,
    Editor,
    Viewer,
}

impl BuiltinRole {
    /// Role id and key.
    pub fn id(&self) -> &'static str {
        match self {
            Self::SuperAdmin => "super_admin",
            Self::Editor => "editor",
            Self::Viewer => "viewer",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SuperAdmin => "Super Admin",
            Self::Editor => "Editor",
            Self::Viewer => "Viewer",
        }
    }

    /// Flags granted on each bootstrapped resource type.
    pub fn flags(&self) -> ResourceFlags {
        match self {
            Self::SuperAdmin => ResourceFlags::NONE,
            Self::Editor => ResourceFlags::from_flags([
                ResourceFlag::ViewOwn,
                ResourceFlag::Create,
                ResourceFlag::EditOwn,
                ResourceFlag::DeleteOwn,
            ]),
            Self::Viewer => ResourceFlags::from_flags([ResourceFlag::ViewTenant]),
        }
    }

    pub fn role_id(&self) -> RoleId {
        RoleId::new(self.id())
    }

    pub fn to_role(&self) -> Result<Role> {
        let role = Role::new(RoleKey::parse(self.id())?, self.name())
            .with_id(self.role_id())
            .system();
        Ok(match self {
            Self::SuperAdmin => role.super_admin(),
            _ => role,
        })
    }

    pub fn all() -> Vec<BuiltinRole> {
        vec![Self::SuperAdmin, Self::Editor, Self::Viewer]
    }
}

/// Create any missing built-in roles and their global rows on `resource_types`.
///
/// Safe to run repeatedly: existing roles are left untouched and rows are
/// upserted. Fails with a conflict, writing nothing, when another role
/// already holds a built-in key.
pub async fn bootstrap<A>(admin: &A, resource_types: &[ResourceType]) -> Result<Vec<Role>>
where
    A: PolicyAdmin + ?Sized,
{
    let existing = admin.list_roles().await?;

    // Refuse before writing anything if an operator role holds a built-in key.
    for builtin in BuiltinRole::all() {
        if let Some(clash) = existing
            .iter()
            .find(|role| role.key.as_str() == builtin.id() && role.id != builtin.role_id())
        {
            return Err(AuthzError::conflict(format!(
                "built-in role key {} is already used by role {}",
                builtin.id(),
                clash.id
            )));
        }
    }

    let mut roles = Vec::new();

    for builtin in BuiltinRole::all() {
        let role = match existing.iter().find(|role| role.id == builtin.role_id()) {
            Some(role) => role.clone(),
            None => {
                info!(role = builtin.id(), "Creating built-in role");
                admin.create_role(builtin.to_role()?).await?
            }
        };

        let flags = builtin.flags();
        if !flags.is_empty() {
            for resource_type in resource_types {
                let mut row = ResourcePermission::new(resource_type.clone()).for_role(role.id.clone());
                row.flags = flags;
                admin.upsert_resource_permission(row).await?;
            }
        }
        roles.push(role);
    }

    Ok(roles)
}
