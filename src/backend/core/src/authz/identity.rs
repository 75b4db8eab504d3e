//! Identity adapter.
//!
//! The host's authentication layer supplies an [`IdentityContext`]; the
//! [`IdentityResolver`] turns it into the [`Subject`] every decision is made
//! for: the user's id, acting tenant, held roles, and super-admin flag.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::models::{RoleId, TenantId, UserId};
use super::store::PolicyStore;
use crate::error::Result;

// ═══════════════════════════════════════════════════════════════════════════════
// Identity Context (from the session layer)
// ═══════════════════════════════════════════════════════════════════════════════

/// What the authentication layer knows about the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityContext {
    pub user_id: UserId,
    /// Acting tenant. `None` for global users.
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    /// Roles already known to the session. Fetched from the store when absent.
    #[serde(default)]
    pub role_ids: Option<Vec<RoleId>>,
    /// Session-level super-admin marker (e.g. an operator login).
    #[serde(default)]
    pub super_admin_override: bool,
    #[serde(default)]
    pub request_id: Option<String>,
}

impl IdentityContext {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: None,
            role_ids: None,
            super_admin_override: false,
            request_id: None,
        }
    }

    pub fn in_tenant(mut self, tenant_id: impl Into<TenantId>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_roles(mut self, role_ids: impl IntoIterator<Item = RoleId>) -> Self {
        self.role_ids = Some(role_ids.into_iter().collect());
        self
    }

    pub fn super_admin(mut self) -> Self {
        self.super_admin_override = true;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Subject
// ═══════════════════════════════════════════════════════════════════════════════

/// The principal an authorization decision is made for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub user_id: UserId,
    pub tenant_id: Option<TenantId>,
    pub role_ids: Vec<RoleId>,
    pub is_super_admin: bool,
}

impl Subject {
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: None,
            role_ids: Vec::new(),
            is_super_admin: false,
        }
    }

    pub fn in_tenant(mut self, tenant_id: impl Into<TenantId>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_roles(mut self, role_ids: impl IntoIterator<Item = RoleId>) -> Self {
        self.role_ids = role_ids.into_iter().collect();
        self
    }

    pub fn super_admin(mut self) -> Self {
        self.is_super_admin = true;
        self
    }

    /// Whether this subject owns a record with the given owner.
    pub fn owns(&self, owner_id: Option<&UserId>) -> bool {
        owner_id == Some(&self.user_id)
    }
}

/// Relationship between the subject and the record being acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Owned,
    NotOwned,
}

impl Ownership {
    /// Ownership of a record whose owner column holds `owner_id`.
    pub fn of(subject: &Subject, owner_id: Option<&UserId>) -> Self {
        if subject.owns(owner_id) {
            Self::Owned
        } else {
            Self::NotOwned
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resolver
// ═══════════════════════════════════════════════════════════════════════════════

/// Builds a [`Subject`] from an [`IdentityContext`].
#[derive(Clone)]
pub struct IdentityResolver {
    store: Arc<dyn PolicyStore>,
}

impl IdentityResolver {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self { store }
    }

    /// Resolve the subject's roles and super-admin status.
    ///
    /// Roles owned by a tenant other than the acting one are dropped, as are
    /// ids the store does not know. A session override marks the subject
    /// super-admin without touching the store.
    pub async fn resolve(&self, identity: &IdentityContext) -> Result<Subject> {
        if identity.super_admin_override {
            return Ok(Subject {
                user_id: identity.user_id.clone(),
                tenant_id: identity.tenant_id.clone(),
                role_ids: identity.role_ids.clone().unwrap_or_default(),
                is_super_admin: true,
            });
        }

        let requested = match &identity.role_ids {
            Some(role_ids) => role_ids.clone(),
            None => self.store.get_roles_for_user(&identity.user_id).await?,
        };

        let roles = self.store.get_roles(&requested).await?;
        let tenant_id = identity.tenant_id.as_ref();

        let mut role_ids = Vec::with_capacity(requested.len());
        let mut is_super_admin = false;
        for role_id in &requested {
            let Some(role) = roles.iter().find(|role| &role.id == role_id) else {
                continue;
            };
            if !role.applies_to_tenant(tenant_id) {
                debug!(
                    user_id = %identity.user_id,
                    role = %role.key,
                    "Dropping role owned by another tenant"
                );
                continue;
            }
            is_super_admin |= role.is_super_admin;
            if !role_ids.contains(role_id) {
                role_ids.push(role_id.clone());
            }
        }

        Ok(Subject {
            user_id: identity.user_id.clone(),
            tenant_id: identity.tenant_id.clone(),
            role_ids,
            is_super_admin,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
