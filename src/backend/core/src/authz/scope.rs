//! Listing scope: how much of a resource type a subject may list.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::identity::Subject;
use super::models::{TenantId, UserId};

/// Widest visibility a subject has over a resource type.
///
/// Ordered narrowest first, so `Scope::All > Scope::Tenant` holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scope {
    None,
    Own,
    Tenant,
    All,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Own => "OWN",
            Self::Tenant => "TENANT",
            Self::All => "ALL",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Row filter a listing query should apply for `subject`.
    ///
    /// A subject without a tenant gets `Tenant(None)`, i.e. global rows only.
    pub fn filter(&self, subject: &Subject) -> ScopeFilter {
        match self {
            Self::All => ScopeFilter::All,
            Self::Tenant => ScopeFilter::Tenant(subject.tenant_id.clone()),
            Self::Own => ScopeFilter::Owner(subject.user_id.clone()),
            Self::None => ScopeFilter::Nothing,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concrete row restriction derived from a [`Scope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeFilter {
    /// No restriction.
    All,
    /// `tenant_id = ?` (or `tenant_id IS NULL` for `None`).
    Tenant(Option<TenantId>),
    /// `owner_id = ?`
    Owner(UserId),
    /// Match no rows.
    Nothing,
}

impl ScopeFilter {
    /// Whether a record with the given owner and tenant passes the filter.
    pub fn permits(&self, owner_id: Option<&UserId>, tenant_id: Option<&TenantId>) -> bool {
        match self {
            Self::All => true,
            Self::Tenant(tenant) => tenant.as_ref() == tenant_id,
            Self::Owner(owner) => owner_id == Some(owner),
            Self::Nothing => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_ordering() {
        assert!(Scope::All > Scope::Tenant);
        assert!(Scope::Tenant > Scope::Own);
        assert!(Scope::Own > Scope::None);
        assert_eq!(Scope::Tenant.to_string(), "TENANT");
    }

    #[test]
    fn test_filters() {
        let subject = Subject::new("u1").in_tenant("5");
        let five = TenantId::new("5");
        let u1 = UserId::new("u1");
        let u2 = UserId::new("u2");

        assert!(Scope::All.filter(&subject).permits(None, None));

        let tenant = Scope::Tenant.filter(&subject);
        assert!(tenant.permits(Some(&u2), Some(&five)));
        assert!(!tenant.permits(Some(&u1), Some(&TenantId::new("6"))));
        assert!(!tenant.permits(Some(&u1), None));

        let own = Scope::Own.filter(&subject);
        assert!(own.permits(Some(&u1), Some(&TenantId::new("6"))));
        assert!(!own.permits(Some(&u2), Some(&five)));

        assert!(!Scope::None.filter(&subject).permits(Some(&u1), Some(&five)));
    }

    #[test]
    fn test_tenant_filter_without_tenant_matches_global_rows() {
        let filter = Scope::Tenant.filter(&Subject::new("u1"));
        assert_eq!(filter, ScopeFilter::Tenant(None));
        assert!(filter.permits(None, None));
        assert!(!filter.permits(None, Some(&TenantId::new("5"))));
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&Scope::Own).unwrap(), "\"OWN\"");
        let scope: Scope = serde_json::from_str("\"ALL\"").unwrap();
        assert_eq!(scope, Scope::All);
    }
}
