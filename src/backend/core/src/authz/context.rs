//! Request-scoped authorization context.
//!
//! An [`AuthorizationContext`] is built once per request: the subject's
//! coarse permission keys and matching resource rows are loaded into a
//! [`PolicySnapshot`] under a deadline, and every later question is answered
//! from that snapshot. Answers within one request are therefore consistent
//! even while administrators edit policy concurrently.
//!
//! Any failure while loading yields a context that denies everything.

use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::Instant as TokioInstant;
use tracing::{debug, warn};

use super::engine::{self, Decision};
use super::identity::{IdentityContext, IdentityResolver, Ownership, Subject};
use super::models::{PermissionKey, ResourceFlag, ResourceFlags, ResourcePermission, ResourceType};
use super::scope::{Scope, ScopeFilter};
use super::store::{MatchedResourcePermissions, PolicyStore};
use crate::config::EngineConfig;
use crate::error::{AuthzError, Result};
use crate::telemetry::{DecisionKind, DecisionMetrics};

static NO_ROWS: MatchedResourcePermissions = MatchedResourcePermissions {
    tenant: Vec::new(),
    global: Vec::new(),
};

// ═══════════════════════════════════════════════════════════════════════════════
// Snapshot
// ═══════════════════════════════════════════════════════════════════════════════

/// Everything needed to answer a subject's questions without further I/O.
#[derive(Debug, Clone, Default)]
pub struct PolicySnapshot {
    permission_keys: HashSet<PermissionKey>,
    resources: HashMap<ResourceType, MatchedResourcePermissions>,
}

impl PolicySnapshot {
    pub fn new(
        permission_keys: HashSet<PermissionKey>,
        rows: impl IntoIterator<Item = ResourcePermission>,
    ) -> Self {
        let mut resources: HashMap<ResourceType, MatchedResourcePermissions> = HashMap::new();
        for row in rows {
            resources.entry(row.resource_type.clone()).or_default().push(row);
        }
        Self {
            permission_keys,
            resources,
        }
    }

    /// Read the subject's keys and rows from the store.
    pub async fn fetch(store: &dyn PolicyStore, subject: &Subject) -> Result<Self> {
        if subject.role_ids.is_empty() {
            // Role-less baseline rows may still apply.
            let rows = store
                .get_subject_resource_permissions(&[], subject.tenant_id.as_ref())
                .await?;
            return Ok(Self::new(HashSet::new(), rows));
        }

        let permission_keys = store.get_role_permission_keys(&subject.role_ids).await?;
        let rows = store
            .get_subject_resource_permissions(&subject.role_ids, subject.tenant_id.as_ref())
            .await?;
        Ok(Self::new(permission_keys, rows))
    }

    pub fn permission_keys(&self) -> &HashSet<PermissionKey> {
        &self.permission_keys
    }

    /// Matching rows for a resource type (empty when none match).
    pub fn resource(&self, resource_type: &str) -> &MatchedResourcePermissions {
        self.resources.get(resource_type).unwrap_or(&NO_ROWS)
    }

    pub fn resource_types(&self) -> impl Iterator<Item = &ResourceType> {
        self.resources.keys()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Authorization Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Query facade over one subject's policy snapshot.
#[derive(Debug)]
pub struct AuthorizationContext {
    subject: Subject,
    snapshot: PolicySnapshot,
    fail_closed: bool,
    memo: Option<DashMap<String, ResourceFlags>>,
}

impl AuthorizationContext {
    /// Wrap an already-loaded snapshot.
    pub fn from_snapshot(subject: Subject, snapshot: PolicySnapshot, memoize: bool) -> Self {
        Self {
            subject,
            snapshot,
            fail_closed: false,
            memo: memoize.then(DashMap::new),
        }
    }

    /// A context that denies every question, super-admin included.
    pub fn deny_all(subject: Subject) -> Self {
        Self {
            subject,
            snapshot: PolicySnapshot::default(),
            fail_closed: true,
            memo: None,
        }
    }

    /// Load the subject's snapshot within the configured deadline.
    ///
    /// Super-admins skip the store entirely.
    pub async fn load(store: &dyn PolicyStore, subject: Subject, config: &EngineConfig) -> Result<Self> {
        let deadline = TokioInstant::now() + config.decision_timeout();
        Self::load_until(store, subject, config, deadline).await
    }

    /// Load the subject's snapshot, failing once `deadline` has passed.
    pub async fn load_until(
        store: &dyn PolicyStore,
        subject: Subject,
        config: &EngineConfig,
        deadline: TokioInstant,
    ) -> Result<Self> {
        if subject.is_super_admin {
            debug!(user_id = %subject.user_id, "Super-admin context, skipping policy lookup");
            return Ok(Self::from_snapshot(subject, PolicySnapshot::default(), false));
        }

        let started = Instant::now();
        let snapshot = tokio::time::timeout_at(deadline, PolicySnapshot::fetch(store, &subject))
            .await
            .map_err(|_| AuthzError::deadline_exceeded(config.decision_timeout_ms))??;
        DecisionMetrics::record_snapshot_load(started.elapsed());

        debug!(
            user_id = %subject.user_id,
            roles = subject.role_ids.len(),
            permission_keys = snapshot.permission_keys.len(),
            resource_types = snapshot.resources.len(),
            "Policy snapshot loaded"
        );
        Ok(Self::from_snapshot(subject, snapshot, config.memoize))
    }

    /// [`load`](Self::load), denying everything on failure.
    pub async fn load_or_deny(store: &dyn PolicyStore, subject: Subject, config: &EngineConfig) -> Self {
        match Self::load(store, subject.clone(), config).await {
            Ok(context) => context,
            Err(error) => Self::fail_closed(subject, &error),
        }
    }

    /// Resolve an identity and load its snapshot under a single deadline.
    pub async fn establish(
        store: Arc<dyn PolicyStore>,
        identity: &IdentityContext,
        config: &EngineConfig,
    ) -> Result<Self> {
        let deadline = TokioInstant::now() + config.decision_timeout();
        let resolver = IdentityResolver::new(store.clone());
        let subject = tokio::time::timeout_at(deadline, resolver.resolve(identity))
            .await
            .map_err(|_| AuthzError::deadline_exceeded(config.decision_timeout_ms))??;
        // Whatever resolution spent is gone from the load budget.
        Self::load_until(store.as_ref(), subject, config, deadline).await
    }

    /// [`establish`](Self::establish), denying everything on failure.
    pub async fn establish_or_deny(
        store: Arc<dyn PolicyStore>,
        identity: &IdentityContext,
        config: &EngineConfig,
    ) -> Self {
        match Self::establish(store, identity, config).await {
            Ok(context) => context,
            Err(error) => {
                let mut subject = Subject::new(identity.user_id.clone());
                subject.tenant_id = identity.tenant_id.clone();
                Self::fail_closed(subject, &error)
            }
        }
    }

    fn fail_closed(subject: Subject, error: &AuthzError) -> Self {
        error.log();
        warn!(
            user_id = %subject.user_id,
            error_code = %error.code(),
            "Policy unavailable, denying all access for request"
        );
        DecisionMetrics::record_fail_closed(error.code().category());
        Self::deny_all(subject)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn snapshot(&self) -> &PolicySnapshot {
        &self.snapshot
    }

    pub fn is_super_admin(&self) -> bool {
        !self.fail_closed && self.subject.is_super_admin
    }

    /// Whether this context was produced by a failed load.
    pub fn is_fail_closed(&self) -> bool {
        self.fail_closed
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Coarse capabilities
    // ─────────────────────────────────────────────────────────────────────────

    /// Check a coarse permission key. Unknown keys are denied.
    pub fn check(&self, key: &str) -> Decision {
        let decision = if self.fail_closed {
            Decision::deny("policy unavailable")
        } else {
            engine::has_capability(&self.subject, &self.snapshot.permission_keys, key)
        };
        DecisionMetrics::record(DecisionKind::Capability, &decision);
        decision
    }

    pub fn can(&self, key: &str) -> bool {
        self.check(key).is_allowed()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Resource flags
    // ─────────────────────────────────────────────────────────────────────────

    /// All flags granted on a resource type.
    pub fn effective_flags(&self, resource_type: &str) -> ResourceFlags {
        if self.fail_closed {
            return ResourceFlags::NONE;
        }
        let compute = || engine::effective_flags(&self.subject, self.snapshot.resource(resource_type));
        match &self.memo {
            Some(memo) => {
                if let Some(flags) = memo.get(resource_type) {
                    return *flags;
                }
                *memo.entry(resource_type.to_string()).or_insert_with(compute)
            }
            None => compute(),
        }
    }

    /// Check one fine-grained flag, with a denial reason.
    pub fn check_resource(&self, resource_type: &str, flag: ResourceFlag) -> Decision {
        let decision = if self.fail_closed {
            Decision::deny("policy unavailable")
        } else if self.effective_flags(resource_type).get(flag) {
            Decision::Allow
        } else {
            engine::has_resource_capability(&self.subject, self.snapshot.resource(resource_type), flag)
        };

        if decision.is_denied() {
            debug!(
                user_id = %self.subject.user_id,
                resource_type = resource_type,
                flag = flag.as_str(),
                decision = ?decision,
                "Resource flag denied"
            );
        }
        DecisionMetrics::record(DecisionKind::ResourceFlag, &decision);
        decision
    }

    pub fn has_flag(&self, resource_type: &str, flag: ResourceFlag) -> bool {
        self.check_resource(resource_type, flag).is_allowed()
    }

    pub fn can_view_all(&self, resource_type: &str) -> bool {
        self.has_flag(resource_type, ResourceFlag::ViewAll)
    }

    pub fn can_view_own(&self, resource_type: &str) -> bool {
        self.has_flag(resource_type, ResourceFlag::ViewOwn)
    }

    pub fn can_view_tenant(&self, resource_type: &str) -> bool {
        self.has_flag(resource_type, ResourceFlag::ViewTenant)
    }

    pub fn can_create(&self, resource_type: &str) -> bool {
        self.has_flag(resource_type, ResourceFlag::Create)
    }

    pub fn can_edit_all(&self, resource_type: &str) -> bool {
        self.has_flag(resource_type, ResourceFlag::EditAll)
    }

    pub fn can_edit_own(&self, resource_type: &str) -> bool {
        self.has_flag(resource_type, ResourceFlag::EditOwn)
    }

    pub fn can_delete_all(&self, resource_type: &str) -> bool {
        self.has_flag(resource_type, ResourceFlag::DeleteAll)
    }

    pub fn can_delete_own(&self, resource_type: &str) -> bool {
        self.has_flag(resource_type, ResourceFlag::DeleteOwn)
    }

    /// Whether the subject may see at least some records of the type.
    pub fn can_view_at_all(&self, resource_type: &str) -> bool {
        !self.resolve_scope(resource_type).is_none()
    }

    /// Edit a specific record: `edit_all`, or `edit_own` on an owned record.
    pub fn can_edit(&self, resource_type: &str, ownership: Ownership) -> bool {
        self.can_edit_all(resource_type)
            || (ownership == Ownership::Owned && self.can_edit_own(resource_type))
    }

    /// Delete a specific record: `delete_all`, or `delete_own` on an owned record.
    pub fn can_delete(&self, resource_type: &str, ownership: Ownership) -> bool {
        self.can_delete_all(resource_type)
            || (ownership == Ownership::Owned && self.can_delete_own(resource_type))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scope
    // ─────────────────────────────────────────────────────────────────────────

    /// Widest listing scope on a resource type.
    pub fn resolve_scope(&self, resource_type: &str) -> Scope {
        let scope = if self.fail_closed {
            Scope::None
        } else if self.subject.is_super_admin {
            Scope::All
        } else {
            engine::scope_from_flags(self.effective_flags(resource_type))
        };
        DecisionMetrics::record_scope(scope.as_str());
        scope
    }

    /// Row filter for a listing query on a resource type.
    pub fn scope_filter(&self, resource_type: &str) -> ScopeFilter {
        self.resolve_scope(resource_type).filter(&self.subject)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
