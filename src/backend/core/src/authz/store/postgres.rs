//! PostgreSQL policy store.
//!
//! Upserts of resource permissions are atomic per identity key through the
//! `resource_permissions_identity` constraint (`NULLS NOT DISTINCT`), so
//! concurrent administrators cannot lose each other's updates.

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

use super::{MatchedResourcePermissions, PolicyAdmin, PolicyStore};
use crate::authz::models::{
    Permission, PermissionId, PermissionKey, ResourceFlags, ResourcePermission,
    ResourcePermissionKey, ResourceType, Role, RoleAssignment, RoleId, RoleKey, TenantId, UserId,
};
use crate::config::DatabaseConfig;
use crate::error::{AuthzError, Result};

const ROLE_COLUMNS: &str =
    "id, key, name, is_super_admin, is_system, tenant_id, created_at, updated_at";

const RESOURCE_COLUMNS: &str = r#"resource_type, permission_id, role_id, tenant_id,
    view_all, view_own, view_tenant, "create", edit_all, edit_own, delete_all, delete_own"#;

/// Rows for a subject: resource type filter optional ($1), tenant ($2), roles ($3).
const SUBJECT_ROWS_FILTER: &str = r#"
    WHERE ($1::TEXT IS NULL OR rp.resource_type = $1)
      AND (rp.tenant_id IS NULL OR rp.tenant_id = $2)
      AND (
        rp.role_id = ANY($3)
        OR (rp.role_id IS NULL AND (
            rp.permission_id IS NULL
            OR rp.permission_id IN (
                SELECT permission_id FROM role_permissions WHERE role_id = ANY($3)
            )
        ))
      )
"#;

/// Stored keys were validated on write; a malformed one means corrupt data.
fn stored<T>(parsed: Result<T>) -> Result<T> {
    parsed.map_err(|e| AuthzError::configuration(format!("corrupt stored key: {}", e)))
}

fn role_from_row(row: &PgRow) -> Result<Role> {
    Ok(Role {
        id: RoleId::new(row.try_get::<String, _>("id")?),
        key: stored(RoleKey::parse(row.try_get::<String, _>("key")?))?,
        name: row.try_get("name")?,
        is_super_admin: row.try_get("is_super_admin")?,
        is_system: row.try_get("is_system")?,
        tenant_id: row.try_get::<Option<String>, _>("tenant_id")?.map(TenantId::new),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn permission_from_row(row: &PgRow) -> Result<Permission> {
    Ok(Permission {
        id: PermissionId::new(row.try_get::<String, _>("id")?),
        key: stored(PermissionKey::parse(row.try_get::<String, _>("key")?))?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
    })
}

fn resource_permission_from_row(row: &PgRow) -> Result<ResourcePermission> {
    let mut raw = [0i64; 8];
    for (slot, column) in raw.iter_mut().zip([
        "view_all",
        "view_own",
        "view_tenant",
        "create",
        "edit_all",
        "edit_own",
        "delete_all",
        "delete_own",
    ]) {
        *slot = i64::from(row.try_get::<i16, _>(column)?);
    }

    Ok(ResourcePermission {
        resource_type: stored(ResourceType::parse(row.try_get::<String, _>("resource_type")?))?,
        permission_id: row
            .try_get::<Option<String>, _>("permission_id")?
            .map(PermissionId::new),
        role_id: row.try_get::<Option<String>, _>("role_id")?.map(RoleId::new),
        tenant_id: row.try_get::<Option<String>, _>("tenant_id")?.map(TenantId::new),
        flags: ResourceFlags::decode_columns(raw)?,
    })
}

fn role_id_strings(role_ids: &[RoleId]) -> Vec<String> {
    role_ids.iter().map(|id| id.0.clone()).collect()
}

/// Policy store backed by PostgreSQL.
#[derive(Clone)]
pub struct PgPolicyStore {
    pool: PgPool,
}

impl PgPolicyStore {
    /// Connect a pool using the database configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
            .connect(&config.url)
            .await?;

        info!(max_connections = config.max_connections, "Connected policy store");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AuthzError::from(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn subject_rows(
        &self,
        resource_type: Option<&ResourceType>,
        role_ids: &[RoleId],
        tenant_id: Option<&TenantId>,
    ) -> Result<Vec<ResourcePermission>> {
        let sql = format!(
            "SELECT {} FROM resource_permissions rp {}",
            RESOURCE_COLUMNS, SUBJECT_ROWS_FILTER
        );
        let rows = sqlx::query(&sql)
            .bind(resource_type.map(|t| t.as_str().to_string()))
            .bind(tenant_id.map(|t| t.0.clone()))
            .bind(role_id_strings(role_ids))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(resource_permission_from_row).collect()
    }
}

#[async_trait]
impl PolicyStore for PgPolicyStore {
    async fn get_roles_for_user(&self, user_id: &UserId) -> Result<Vec<RoleId>> {
        let rows = sqlx::query(
            r#"
            SELECT role_id FROM role_assignments
            WHERE user_id = $1 AND (expires_at IS NULL OR expires_at > NOW())
            ORDER BY created_at, role_id
            "#,
        )
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<RoleId> { Ok(RoleId::new(row.try_get::<String, _>("role_id")?)) })
            .collect()
    }

    async fn get_roles(&self, role_ids: &[RoleId]) -> Result<Vec<Role>> {
        let sql = format!("SELECT {} FROM roles WHERE id = ANY($1)", ROLE_COLUMNS);
        let rows = sqlx::query(&sql)
            .bind(role_id_strings(role_ids))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(role_from_row).collect()
    }

    async fn get_role_permission_keys(&self, role_ids: &[RoleId]) -> Result<HashSet<PermissionKey>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT p.key FROM role_permissions rp
            JOIN permissions p ON p.id = rp.permission_id
            WHERE rp.role_id = ANY($1)
            "#,
        )
        .bind(role_id_strings(role_ids))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<PermissionKey> {
                stored(PermissionKey::parse(row.try_get::<String, _>("key")?))
            })
            .collect()
    }

    async fn get_resource_permissions(
        &self,
        resource_type: &ResourceType,
        role_ids: &[RoleId],
        tenant_id: Option<&TenantId>,
    ) -> Result<MatchedResourcePermissions> {
        let mut matched = MatchedResourcePermissions::default();
        for row in self.subject_rows(Some(resource_type), role_ids, tenant_id).await? {
            matched.push(row);
        }
        Ok(matched)
    }

    async fn get_subject_resource_permissions(
        &self,
        role_ids: &[RoleId],
        tenant_id: Option<&TenantId>,
    ) -> Result<Vec<ResourcePermission>> {
        self.subject_rows(None, role_ids, tenant_id).await
    }
}

#[async_trait]
impl PolicyAdmin for PgPolicyStore {
    async fn create_role(&self, role: Role) -> Result<Role> {
        let sql = format!(
            "INSERT INTO roles ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {}",
            ROLE_COLUMNS, ROLE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(role.id.as_str())
            .bind(role.key.as_str())
            .bind(&role.name)
            .bind(role.is_super_admin)
            .bind(role.is_system)
            .bind(role.tenant_id.as_ref().map(|t| t.as_str()))
            .bind(role.created_at)
            .bind(role.updated_at)
            .fetch_one(&self.pool)
            .await?;

        debug!(role_id = %role.id, role_key = %role.key, "Created role");
        role_from_row(&row)
    }

    async fn update_role(&self, role: Role) -> Result<Role> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"UPDATE roles SET key = $2, name = $3, is_super_admin = $4, tenant_id = $5,
                updated_at = NOW()
               WHERE id = $1 RETURNING {}"#,
            ROLE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(role.id.as_str())
            .bind(role.key.as_str())
            .bind(&role.name)
            .bind(role.is_super_admin)
            .bind(role.tenant_id.as_ref().map(|t| t.as_str()))
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AuthzError::not_found("role", role.id.as_str()))?;
        let updated = role_from_row(&row)?;

        // The updated row stays locked, so concurrent upserts wait for us.
        if let Some(tenant_id) = &role.tenant_id {
            let stranded: bool = sqlx::query_scalar(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM resource_permissions
                    WHERE role_id = $1 AND tenant_id IS NOT NULL AND tenant_id <> $2
                )
                "#,
            )
            .bind(role.id.as_str())
            .bind(tenant_id.as_str())
            .fetch_one(&mut *tx)
            .await?;
            if stranded {
                return Err(AuthzError::validation(format!(
                    "role {} still has resource permissions in another tenant",
                    role.key
                )));
            }
        }

        tx.commit().await?;

        debug!(role_id = %updated.id, "Updated role");
        Ok(updated)
    }

    async fn delete_role(&self, role_id: &RoleId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT r.key, r.is_system,
                   EXISTS (SELECT 1 FROM role_assignments a WHERE a.role_id = r.id) AS assigned
            FROM roles r WHERE r.id = $1 FOR UPDATE
            "#,
        )
        .bind(role_id.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AuthzError::not_found("role", role_id.as_str()))?;

        let key: String = row.try_get("key")?;
        if row.try_get::<bool, _>("is_system")? {
            return Err(AuthzError::conflict(format!("cannot delete system role: {}", key)));
        }
        if row.try_get::<bool, _>("assigned")? {
            return Err(AuthzError::conflict(format!("role is still assigned to users: {}", key)));
        }

        sqlx::query("DELETE FROM roles WHERE id = $1")
            .bind(role_id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(role_id = %role_id, "Deleted role");
        Ok(())
    }

    async fn list_roles(&self) -> Result<Vec<Role>> {
        let sql = format!("SELECT {} FROM roles ORDER BY key", ROLE_COLUMNS);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(role_from_row).collect()
    }

    async fn create_permission(&self, permission: Permission) -> Result<Permission> {
        sqlx::query("INSERT INTO permissions (id, key, name, description) VALUES ($1, $2, $3, $4)")
            .bind(permission.id.as_str())
            .bind(permission.key.as_str())
            .bind(&permission.name)
            .bind(&permission.description)
            .execute(&self.pool)
            .await?;
        Ok(permission)
    }

    async fn update_permission(&self, permission: Permission) -> Result<Permission> {
        let result = sqlx::query(
            "UPDATE permissions SET key = $2, name = $3, description = $4 WHERE id = $1",
        )
        .bind(permission.id.as_str())
        .bind(permission.key.as_str())
        .bind(&permission.name)
        .bind(&permission.description)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AuthzError::not_found("permission", permission.id.as_str()));
        }
        Ok(permission)
    }

    async fn delete_permission(&self, permission_id: &PermissionId) -> Result<()> {
        // Foreign keys restrict deletion while the permission is referenced.
        let result = sqlx::query("DELETE FROM permissions WHERE id = $1")
            .bind(permission_id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AuthzError::not_found("permission", permission_id.as_str()));
        }
        Ok(())
    }

    async fn list_permissions(&self) -> Result<Vec<Permission>> {
        let rows = sqlx::query("SELECT id, key, name, description FROM permissions ORDER BY key")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(permission_from_row).collect()
    }

    async fn assign_permission(&self, role_id: &RoleId, permission_id: &PermissionId) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO role_permissions (role_id, permission_id)
            SELECT r.id, p.id FROM roles r, permissions p WHERE r.id = $1 AND p.id = $2
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(role_id.as_str())
        .bind(permission_id.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let exists: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM role_permissions WHERE role_id = $1 AND permission_id = $2)",
            )
            .bind(role_id.as_str())
            .bind(permission_id.as_str())
            .fetch_one(&self.pool)
            .await?;
            if !exists {
                return Err(AuthzError::not_found(
                    "role or permission",
                    format!("{}/{}", role_id, permission_id),
                ));
            }
        }
        Ok(())
    }

    async fn revoke_permission(&self, role_id: &RoleId, permission_id: &PermissionId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM role_permissions WHERE role_id = $1 AND permission_id = $2")
            .bind(role_id.as_str())
            .bind(permission_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn assign_role(&self, assignment: RoleAssignment) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO role_assignments (user_id, role_id, created_at, expires_at, granted_by)
            SELECT $1, r.id, $3, $4, $5 FROM roles r WHERE r.id = $2
            ON CONFLICT (user_id, role_id) DO UPDATE
                SET expires_at = EXCLUDED.expires_at, granted_by = EXCLUDED.granted_by
            "#,
        )
        .bind(assignment.user_id.as_str())
        .bind(assignment.role_id.as_str())
        .bind(assignment.created_at)
        .bind(assignment.expires_at)
        .bind(assignment.granted_by.as_ref().map(|u| u.as_str()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AuthzError::not_found("role", assignment.role_id.as_str()));
        }
        Ok(())
    }

    async fn unassign_role(&self, user_id: &UserId, role_id: &RoleId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM role_assignments WHERE user_id = $1 AND role_id = $2")
            .bind(user_id.as_str())
            .bind(role_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_resource_permission(&self, row: ResourcePermission) -> Result<ResourcePermission> {
        let mut tx = self.pool.begin().await?;

        if let Some(role_id) = &row.role_id {
            let role_row = sqlx::query("SELECT key, tenant_id FROM roles WHERE id = $1 FOR SHARE")
                .bind(role_id.as_str())
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| AuthzError::not_found("role", role_id.as_str()))?;
            let role_tenant: Option<String> = role_row.try_get("tenant_id")?;
            if let (Some(role_tenant), Some(row_tenant)) = (role_tenant, &row.tenant_id) {
                if role_tenant != row_tenant.0 {
                    let key: String = role_row.try_get("key")?;
                    return Err(AuthzError::validation(format!(
                        "role {} belongs to another tenant",
                        key
                    )));
                }
            }
        }

        if let Some(permission_id) = &row.permission_id {
            let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM permissions WHERE id = $1)")
                .bind(permission_id.as_str())
                .fetch_one(&mut *tx)
                .await?;
            if !exists {
                return Err(AuthzError::not_found("permission", permission_id.as_str()));
            }
        }

        let [view_all, view_own, view_tenant, create, edit_all, edit_own, delete_all, delete_own] =
            row.flags.encode_columns();

        let sql = format!(
            r#"
            INSERT INTO resource_permissions ({columns})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT ON CONSTRAINT resource_permissions_identity DO UPDATE SET
                view_all = EXCLUDED.view_all,
                view_own = EXCLUDED.view_own,
                view_tenant = EXCLUDED.view_tenant,
                "create" = EXCLUDED."create",
                edit_all = EXCLUDED.edit_all,
                edit_own = EXCLUDED.edit_own,
                delete_all = EXCLUDED.delete_all,
                delete_own = EXCLUDED.delete_own
            RETURNING {columns}
            "#,
            columns = RESOURCE_COLUMNS
        );
        let stored_row = sqlx::query(&sql)
            .bind(row.resource_type.as_str())
            .bind(row.permission_id.as_ref().map(|p| p.as_str()))
            .bind(row.role_id.as_ref().map(|r| r.as_str()))
            .bind(row.tenant_id.as_ref().map(|t| t.as_str()))
            .bind(view_all)
            .bind(view_own)
            .bind(view_tenant)
            .bind(create)
            .bind(edit_all)
            .bind(edit_own)
            .bind(delete_all)
            .bind(delete_own)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(
            resource_type = %row.resource_type,
            role_id = ?row.role_id,
            tenant_id = ?row.tenant_id,
            "Upserted resource permission"
        );
        resource_permission_from_row(&stored_row)
    }

    async fn delete_resource_permission(&self, key: &ResourcePermissionKey) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM resource_permissions
            WHERE resource_type = $1
              AND permission_id IS NOT DISTINCT FROM $2
              AND role_id IS NOT DISTINCT FROM $3
              AND tenant_id IS NOT DISTINCT FROM $4
            "#,
        )
        .bind(key.resource_type.as_str())
        .bind(key.permission_id.as_ref().map(|p| p.as_str()))
        .bind(key.role_id.as_ref().map(|r| r.as_str()))
        .bind(key.tenant_id.as_ref().map(|t| t.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_resource_permissions(&self, resource_type: &ResourceType) -> Result<Vec<ResourcePermission>> {
        let sql = format!(
            "SELECT {} FROM resource_permissions WHERE resource_type = $1 ORDER BY tenant_id NULLS FIRST, role_id, permission_id",
            RESOURCE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(resource_type.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(resource_permission_from_row).collect()
    }
}
