//! Policy data models: identifiers, validated keys, roles, permissions,
//! assignments, and fine-grained resource permissions.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use uuid::Uuid;

use crate::error::{AuthzError, Result};

/// A single lowercase key segment.
static KEY_SEGMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_]+$").expect("valid key regex"));

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Strongly-typed user identifier.
    UserId
);
string_id!(
    /// Strongly-typed role identifier.
    RoleId
);
string_id!(
    /// Strongly-typed permission identifier.
    PermissionId
);
string_id!(
    /// Strongly-typed tenant identifier. `None` at use sites means global.
    TenantId
);

// ═══════════════════════════════════════════════════════════════════════════════
// Validated keys
// ═══════════════════════════════════════════════════════════════════════════════

fn validate_segments(kind: &str, raw: &str, dotted: bool) -> Result<()> {
    let valid = if dotted {
        !raw.is_empty() && raw.split('.').all(|segment| KEY_SEGMENT.is_match(segment))
    } else {
        KEY_SEGMENT.is_match(raw)
    };
    if valid {
        Ok(())
    } else {
        Err(AuthzError::validation(format!("malformed {}: {:?}", kind, raw)).with_context("key", raw))
    }
}

macro_rules! validated_key {
    ($(#[$meta:meta])* $name:ident, $kind:literal, dotted = $dotted:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Validate and wrap a raw key.
            pub fn parse(raw: impl Into<String>) -> Result<Self> {
                let raw = raw.into();
                validate_segments($kind, &raw, $dotted)?;
                Ok(Self(raw))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = AuthzError;

            fn try_from(raw: String) -> Result<Self> {
                Self::parse(raw)
            }
        }

        impl From<$name> for String {
            fn from(key: $name) -> String {
                key.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

validated_key!(
    /// Unique machine name of a role (`super_admin`, `editor`).
    RoleKey, "role key", dotted = false
);
validated_key!(
    /// Unique machine name of a coarse capability (`manage_themes`,
    /// `certificates_audits.manage`).
    PermissionKey, "permission key", dotted = true
);
validated_key!(
    /// Named category of business entity (`themes`, `jobs`, `entities`).
    ResourceType, "resource type", dotted = true
);

// ═══════════════════════════════════════════════════════════════════════════════
// Role
// ═══════════════════════════════════════════════════════════════════════════════

/// A role groups coarse permissions and fine-grained resource grants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    /// Unique machine name.
    pub key: RoleKey,
    /// Human-readable name.
    pub name: String,
    /// Holding this role makes a subject super-admin.
    pub is_super_admin: bool,
    /// Built-in role, cannot be deleted.
    pub is_system: bool,
    /// Owning tenant (None = global role).
    pub tenant_id: Option<TenantId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Role {
    pub fn new(key: RoleKey, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: RoleId::generate(),
            key,
            name: name.into(),
            is_super_admin: false,
            is_system: false,
            tenant_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Use a caller-chosen id instead of a generated one.
    pub fn with_id(mut self, id: RoleId) -> Self {
        self.id = id;
        self
    }

    /// Flag this role as granting super-admin.
    pub fn super_admin(mut self) -> Self {
        self.is_super_admin = true;
        self
    }

    /// Mark this as a system role.
    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }

    /// Scope this role to a tenant.
    pub fn with_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    /// Whether a subject acting in `tenant_id` may hold this role.
    pub fn applies_to_tenant(&self, tenant_id: Option<&TenantId>) -> bool {
        match &self.tenant_id {
            None => true,
            Some(own) => tenant_id == Some(own),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Permission
// ═══════════════════════════════════════════════════════════════════════════════

/// An entry of the flat, tenant-independent capability catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub id: PermissionId,
    pub key: PermissionKey,
    pub name: String,
    pub description: String,
}

impl Permission {
    pub fn new(key: PermissionKey, name: impl Into<String>) -> Self {
        Self {
            id: PermissionId::generate(),
            key,
            name: name.into(),
            description: String::new(),
        }
    }

    pub fn with_id(mut self, id: PermissionId) -> Self {
        self.id = id;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Many-to-many edge granting a role a coarse permission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RolePermission {
    pub role_id: RoleId,
    pub permission_id: PermissionId,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Role Assignment
// ═══════════════════════════════════════════════════════════════════════════════

/// Binds a user to a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub user_id: UserId,
    pub role_id: RoleId,
    pub created_at: DateTime<Utc>,
    /// When the assignment expires (None = never).
    pub expires_at: Option<DateTime<Utc>>,
    /// Who granted this assignment.
    pub granted_by: Option<UserId>,
}

impl RoleAssignment {
    pub fn new(user_id: UserId, role_id: RoleId) -> Self {
        Self {
            user_id,
            role_id,
            created_at: Utc::now(),
            expires_at: None,
            granted_by: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn granted_by(mut self, user_id: UserId) -> Self {
        self.granted_by = Some(user_id);
        self
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |exp| now < exp)
    }

    pub fn is_active(&self) -> bool {
        self.is_active_at(Utc::now())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resource permissions
// ═══════════════════════════════════════════════════════════════════════════════

/// One of the eight independent fine-grained flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceFlag {
    ViewAll,
    ViewOwn,
    ViewTenant,
    Create,
    EditAll,
    EditOwn,
    DeleteAll,
    DeleteOwn,
}

impl ResourceFlag {
    pub const ALL: [ResourceFlag; 8] = [
        Self::ViewAll,
        Self::ViewOwn,
        Self::ViewTenant,
        Self::Create,
        Self::EditAll,
        Self::EditOwn,
        Self::DeleteAll,
        Self::DeleteOwn,
    ];

    /// Column / wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ViewAll => "view_all",
            Self::ViewOwn => "view_own",
            Self::ViewTenant => "view_tenant",
            Self::Create => "create",
            Self::EditAll => "edit_all",
            Self::EditOwn => "edit_own",
            Self::DeleteAll => "delete_all",
            Self::DeleteOwn => "delete_own",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|flag| flag.as_str() == s)
    }

    const fn bit(self) -> u8 {
        1 << self as u8
    }
}

impl fmt::Display for ResourceFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The eight flags of a resource permission row.
///
/// Flags are independent: setting `edit_all` says nothing about `view_all`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ResourceFlags(u8);

impl ResourceFlags {
    pub const NONE: ResourceFlags = ResourceFlags(0);
    pub const EVERYTHING: ResourceFlags = ResourceFlags(u8::MAX);

    pub fn get(&self, flag: ResourceFlag) -> bool {
        self.0 & flag.bit() != 0
    }

    pub fn set(&mut self, flag: ResourceFlag, value: bool) {
        if value {
            self.0 |= flag.bit();
        } else {
            self.0 &= !flag.bit();
        }
    }

    /// Builder form of [`set`](Self::set) with `true`.
    pub fn with(mut self, flag: ResourceFlag) -> Self {
        self.set(flag, true);
        self
    }

    pub fn from_flags(flags: impl IntoIterator<Item = ResourceFlag>) -> Self {
        flags.into_iter().fold(Self::NONE, Self::with)
    }

    /// Logical OR of both flag sets.
    pub fn union(self, other: ResourceFlags) -> Self {
        Self(self.0 | other.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = ResourceFlag> + '_ {
        ResourceFlag::ALL.into_iter().filter(|flag| self.get(*flag))
    }

    /// Decode one stored integer column. Only `0` and `1` are valid.
    pub fn decode_column(flag: ResourceFlag, raw: i64) -> Result<bool> {
        match raw {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(AuthzError::configuration(format!(
                "resource permission flag {} holds {}",
                flag, other
            ))),
        }
    }

    /// Decode the eight stored columns, in [`ResourceFlag::ALL`] order.
    pub fn decode_columns(raw: [i64; 8]) -> Result<Self> {
        let mut flags = Self::NONE;
        for (flag, value) in ResourceFlag::ALL.into_iter().zip(raw) {
            flags.set(flag, Self::decode_column(flag, value)?);
        }
        Ok(flags)
    }

    /// Encode to stored columns, in [`ResourceFlag::ALL`] order.
    pub fn encode_columns(&self) -> [i16; 8] {
        ResourceFlag::ALL.map(|flag| i16::from(self.get(flag)))
    }
}

impl Serialize for ResourceFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(ResourceFlag::ALL.len()))?;
        for flag in ResourceFlag::ALL {
            map.serialize_entry(flag.as_str(), &self.get(flag))?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ResourceFlags {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = std::collections::HashMap::<String, bool>::deserialize(deserializer)?;
        let mut flags = Self::NONE;
        for (name, value) in raw {
            let flag = ResourceFlag::parse(&name)
                .ok_or_else(|| serde::de::Error::custom(format!("unknown resource flag: {}", name)))?;
            flags.set(flag, value);
        }
        Ok(flags)
    }
}

/// Identity of a resource permission row; upserts replace by this key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourcePermissionKey {
    pub resource_type: ResourceType,
    pub permission_id: Option<PermissionId>,
    pub role_id: Option<RoleId>,
    pub tenant_id: Option<TenantId>,
}

/// Fine-grained grant on a resource type.
///
/// `role_id = None` applies to any role holding `permission_id`, or to
/// everyone when `permission_id` is also `None`. `tenant_id = None` is global.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePermission {
    pub resource_type: ResourceType,
    pub permission_id: Option<PermissionId>,
    pub role_id: Option<RoleId>,
    pub tenant_id: Option<TenantId>,
    pub flags: ResourceFlags,
}

impl ResourcePermission {
    pub fn new(resource_type: ResourceType) -> Self {
        Self {
            resource_type,
            permission_id: None,
            role_id: None,
            tenant_id: None,
            flags: ResourceFlags::NONE,
        }
    }

    pub fn for_role(mut self, role_id: RoleId) -> Self {
        self.role_id = Some(role_id);
        self
    }

    pub fn for_permission(mut self, permission_id: PermissionId) -> Self {
        self.permission_id = Some(permission_id);
        self
    }

    pub fn in_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn grant(mut self, flag: ResourceFlag) -> Self {
        self.flags.set(flag, true);
        self
    }

    pub fn key(&self) -> ResourcePermissionKey {
        ResourcePermissionKey {
            resource_type: self.resource_type.clone(),
            permission_id: self.permission_id.clone(),
            role_id: self.role_id.clone(),
            tenant_id: self.tenant_id.clone(),
        }
    }

    pub fn is_tenant_scoped(&self) -> bool {
        self.tenant_id.is_some()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_role_key_validation() {
        assert!(RoleKey::parse("super_admin").is_ok());
        assert!(RoleKey::parse("editor").is_ok());

        for bad in ["", "Editor", "editor-1", "edit or", "a.b"] {
            let err = RoleKey::parse(bad).unwrap_err();
            assert_eq!(err.code(), ErrorCode::ValidationError, "{bad:?}");
        }
    }

    #[test]
    fn test_permission_key_allows_dotted_segments() {
        assert!(PermissionKey::parse("manage_themes").is_ok());
        assert!(PermissionKey::parse("certificates_audits.manage").is_ok());

        assert!(PermissionKey::parse("certificates..manage").is_err());
        assert!(PermissionKey::parse(".manage").is_err());
        assert!(PermissionKey::parse("manage.").is_err());
        assert!(PermissionKey::parse("Manage").is_err());
    }

    #[test]
    fn test_key_deserialization_validates() {
        let ok: std::result::Result<ResourceType, _> = serde_json::from_str("\"jobs\"");
        assert!(ok.is_ok());
        let bad: std::result::Result<ResourceType, _> = serde_json::from_str("\"Jobs!\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_flags_are_independent() {
        let flags = ResourceFlags::NONE.with(ResourceFlag::EditAll);
        assert!(flags.get(ResourceFlag::EditAll));
        for flag in ResourceFlag::ALL {
            if flag != ResourceFlag::EditAll {
                assert!(!flags.get(flag), "{flag} must not be implied");
            }
        }
    }

    #[test]
    fn test_flags_set_and_union() {
        let mut a = ResourceFlags::NONE;
        a.set(ResourceFlag::ViewOwn, true);
        a.set(ResourceFlag::Create, true);
        a.set(ResourceFlag::Create, false);

        let b = ResourceFlags::from_flags([ResourceFlag::DeleteAll]);
        let both = a.union(b);

        assert_eq!(
            both.iter().collect::<Vec<_>>(),
            vec![ResourceFlag::ViewOwn, ResourceFlag::DeleteAll]
        );
        assert!(ResourceFlags::NONE.is_empty());
    }

    #[test]
    fn test_flag_column_decoding() {
        let flags = ResourceFlags::decode_columns([0, 1, 0, 1, 0, 0, 0, 0]).unwrap();
        assert!(flags.get(ResourceFlag::ViewOwn));
        assert!(flags.get(ResourceFlag::Create));
        assert_eq!(flags.encode_columns(), [0, 1, 0, 1, 0, 0, 0, 0]);

        let err = ResourceFlags::decode_columns([0, 2, 0, 0, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
    }

    #[test]
    fn test_flags_serde_uses_column_names() {
        let flags = ResourceFlags::from_flags([ResourceFlag::ViewTenant]);
        let json = serde_json::to_value(flags).unwrap();
        assert_eq!(json["view_tenant"], true);
        assert_eq!(json["view_all"], false);

        let back: ResourceFlags = serde_json::from_value(json).unwrap();
        assert_eq!(back, flags);

        let unknown = serde_json::json!({ "view_everything": true });
        assert!(serde_json::from_value::<ResourceFlags>(unknown).is_err());
    }

    #[test]
    fn test_role_tenant_applicability() {
        let global = Role::new(RoleKey::parse("editor").unwrap(), "Editor");
        assert!(global.applies_to_tenant(None));
        assert!(global.applies_to_tenant(Some(&TenantId::new("5"))));

        let scoped = global.clone().with_tenant(TenantId::new("5"));
        assert!(scoped.applies_to_tenant(Some(&TenantId::new("5"))));
        assert!(!scoped.applies_to_tenant(Some(&TenantId::new("6"))));
        assert!(!scoped.applies_to_tenant(None));
    }

    #[test]
    fn test_assignment_expiry() {
        let assignment = RoleAssignment::new(UserId::new("u1"), RoleId::new("r1"));
        assert!(assignment.is_active());

        let expired = assignment.with_expiry(Utc::now() - chrono::Duration::hours(1));
        assert!(!expired.is_active());
    }

    #[test]
    fn test_resource_permission_key() {
        let row = ResourcePermission::new(ResourceType::parse("jobs").unwrap())
            .for_role(RoleId::new("editor"))
            .in_tenant(TenantId::new("5"))
            .grant(ResourceFlag::ViewTenant);
        let key = row.key();
        assert_eq!(key.role_id, Some(RoleId::new("editor")));
        assert_eq!(key.tenant_id, Some(TenantId::new("5")));
        assert!(key.permission_id.is_none());
        assert!(row.is_tenant_scoped());
    }
}
