//! Resolution engine.
//!
//! Pure functions over data already fetched from the policy store. Nothing
//! here performs I/O; [`AuthorizationContext`](super::AuthorizationContext)
//! supplies the inputs and memoizes the results.
//!
//! Evaluation order for a resource flag:
//!
//! 1. super-admin subjects are allowed outright
//! 2. tenant-scoped rows matching the subject's tenant
//! 3. global rows
//!
//! Grants are additive. A row with a flag cleared never revokes a grant made
//! by another row, so the outcome is the OR of the flag over every matching
//! row.

use std::collections::HashSet;
use tracing::debug;

use super::identity::Subject;
use super::models::{PermissionKey, ResourceFlag, ResourceFlags, ResourcePermission};
use super::scope::Scope;
use super::store::MatchedResourcePermissions;

// ═══════════════════════════════════════════════════════════════════════════════
// Decision
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of an authorization check. Denial is an outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The action is allowed.
    Allow,
    /// The action is denied, with a reason.
    Deny(String),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Deny(_))
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self::Deny(reason.into())
    }
}

/// Which tier of rows produced a resource grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantTier {
    SuperAdmin,
    Tenant,
    Global,
}

impl GrantTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SuperAdmin => "super_admin",
            Self::Tenant => "tenant",
            Self::Global => "global",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Coarse capabilities
// ═══════════════════════════════════════════════════════════════════════════════

/// `can(key)`: whether any held role grants the permission key.
pub fn has_capability(subject: &Subject, held: &HashSet<PermissionKey>, key: &str) -> Decision {
    if subject.is_super_admin {
        return Decision::Allow;
    }
    if held.contains(key) {
        debug!(user_id = %subject.user_id, permission = key, "Capability granted");
        Decision::Allow
    } else {
        Decision::Deny(format!("no held role grants {}", key))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resource flags
// ═══════════════════════════════════════════════════════════════════════════════

fn any_grants<'a>(rows: impl IntoIterator<Item = &'a ResourcePermission>, flag: ResourceFlag) -> bool {
    rows.into_iter().any(|row| row.flags.get(flag))
}

/// Tier that grants `flag`, if any.
pub fn granting_tier(
    subject: &Subject,
    matched: &MatchedResourcePermissions,
    flag: ResourceFlag,
) -> Option<GrantTier> {
    if subject.is_super_admin {
        Some(GrantTier::SuperAdmin)
    } else if any_grants(&matched.tenant, flag) {
        Some(GrantTier::Tenant)
    } else if any_grants(&matched.global, flag) {
        Some(GrantTier::Global)
    } else {
        None
    }
}

/// Evaluate one fine-grained flag for a subject.
pub fn has_resource_capability(
    subject: &Subject,
    matched: &MatchedResourcePermissions,
    flag: ResourceFlag,
) -> Decision {
    match granting_tier(subject, matched, flag) {
        Some(tier) => {
            debug!(
                user_id = %subject.user_id,
                flag = flag.as_str(),
                tier = tier.as_str(),
                "Resource flag granted"
            );
            Decision::Allow
        }
        None if matched.is_empty() => Decision::deny("no matching resource permissions"),
        None => Decision::Deny(format!("{} not granted by any matching row", flag)),
    }
}

/// Union of every flag granted to the subject.
pub fn effective_flags(subject: &Subject, matched: &MatchedResourcePermissions) -> ResourceFlags {
    if subject.is_super_admin {
        return ResourceFlags::EVERYTHING;
    }
    matched
        .tenant
        .iter()
        .chain(matched.global.iter())
        .fold(ResourceFlags::NONE, |acc, row| acc.union(row.flags))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scope
// ═══════════════════════════════════════════════════════════════════════════════

/// Widest listing scope implied by a set of granted flags.
pub fn scope_from_flags(flags: ResourceFlags) -> Scope {
    if flags.get(ResourceFlag::ViewAll) {
        Scope::All
    } else if flags.get(ResourceFlag::ViewTenant) {
        Scope::Tenant
    } else if flags.get(ResourceFlag::ViewOwn) {
        Scope::Own
    } else {
        Scope::None
    }
}

/// Resolve a subject's listing scope for one resource type.
pub fn resolve_scope(subject: &Subject, matched: &MatchedResourcePermissions) -> Scope {
    if subject.is_super_admin {
        return Scope::All;
    }
    scope_from_flags(effective_flags(subject, matched))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
