//! Query filters for the console-style listing operations.
//!
//! Listing is a full scan of a cache's primary map: every record is tested
//! against the filter, survivors are sorted newest first, and the requested
//! page is sliced out together with the total match count.

use crate::{
    policy::PolicyDetailCache,
    principal::{Principal, PrincipalType},
    resource::ResourceType,
    role::Role,
};
use chrono::{DateTime, Utc};
use std::fmt;

/// Externally supplied filter applied after the built-in ones.
pub type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// Match `value` against `pattern`; a trailing `*` makes the pattern a
/// prefix, a lone `*` matches everything.
pub fn match_name(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

/// Sort newest first and slice out one page. Returns `(total, page)`.
pub fn paginate<T>(
    mut items: Vec<T>,
    modify_time: impl Fn(&T) -> DateTime<Utc>,
    offset: usize,
    limit: Option<usize>,
) -> (usize, Vec<T>) {
    items.sort_by(|a, b| modify_time(b).cmp(&modify_time(a)));
    let total = items.len();
    let page = items
        .into_iter()
        .skip(offset)
        .take(limit.unwrap_or(usize::MAX))
        .collect();
    (total, page)
}

/// Filter for [`crate::strategy::StrategyCache::query`].
#[derive(Default)]
pub struct PolicyQuery {
    pub id: Option<String>,
    /// Exact name, or a prefix ending in `*`.
    pub name: Option<String>,
    /// Owner; a policy owned by someone else still matches when it names
    /// the principal filter.
    pub owner: Option<String>,
    pub default_strategy: Option<bool>,
    pub resource: Option<(ResourceType, String)>,
    pub principal_id: Option<String>,
    pub principal_type: Option<PrincipalType>,
    pub offset: usize,
    pub limit: Option<usize>,
    predicates: Vec<Predicate<crate::policy::PolicyRecord>>,
}

impl fmt::Debug for PolicyQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyQuery")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("default_strategy", &self.default_strategy)
            .field("resource", &self.resource)
            .field("principal_id", &self.principal_id)
            .field("principal_type", &self.principal_type)
            .field("offset", &self.offset)
            .field("limit", &self.limit)
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

impl PolicyQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_default(mut self, default_strategy: bool) -> Self {
        self.default_strategy = Some(default_strategy);
        self
    }

    pub fn with_resource(mut self, res_type: ResourceType, res_id: impl Into<String>) -> Self {
        self.resource = Some((res_type, res_id.into()));
        self
    }

    /// Restrict to policies naming `principal`.
    pub fn with_principal(mut self, principal: &Principal) -> Self {
        self.principal_id = Some(principal.id().to_string());
        self.principal_type = Some(principal.principal_type());
        self
    }

    pub fn with_page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    /// Add an external predicate.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&crate::policy::PolicyRecord) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Box::new(predicate));
        self
    }

    fn has_principal_filter(&self) -> bool {
        self.principal_id.is_some() || self.principal_type.is_some()
    }

    fn matches_principal(&self, policy: &PolicyDetailCache) -> bool {
        match (&self.principal_id, self.principal_type) {
            (Some(id), Some(principal_type)) => {
                policy.has_principal(&Principal::new(id.clone(), principal_type))
            }
            (Some(id), None) => policy.record().principals.iter().any(|p| p.id() == id),
            (None, Some(principal_type)) => policy
                .record()
                .principals
                .iter()
                .any(|p| p.principal_type() == principal_type),
            (None, None) => true,
        }
    }

    /// Whether `policy` passes every filter.
    pub fn matches(&self, policy: &PolicyDetailCache) -> bool {
        let record = policy.record();
        if let Some(id) = &self.id {
            if &record.id != id {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if !match_name(name, &record.name) {
                return false;
            }
        }
        if let Some(owner) = &self.owner {
            if &record.owner != owner
                && !(self.has_principal_filter() && self.matches_principal(policy))
            {
                return false;
            }
        }
        if let Some(default_strategy) = self.default_strategy {
            if record.default_strategy != default_strategy {
                return false;
            }
        }
        if let Some((res_type, res_id)) = &self.resource {
            if !policy.has_resource(*res_type, res_id) {
                return false;
            }
        }
        if !self.matches_principal(policy) {
            return false;
        }
        self.predicates.iter().all(|predicate| predicate(record))
    }
}

/// Filter for [`crate::role_cache::RoleCache::query`].
#[derive(Default)]
pub struct RoleQuery {
    pub id: Option<String>,
    /// Exact name, or a prefix ending in `*`.
    pub name: Option<String>,
    pub owner: Option<String>,
    pub source: Option<String>,
    /// Restrict to roles with this direct member.
    pub member: Option<Principal>,
    pub offset: usize,
    pub limit: Option<usize>,
    predicates: Vec<Predicate<Role>>,
}

impl fmt::Debug for RoleQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleQuery")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("source", &self.source)
            .field("member", &self.member)
            .field("offset", &self.offset)
            .field("limit", &self.limit)
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

impl RoleQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_member(mut self, member: Principal) -> Self {
        self.member = Some(member);
        self
    }

    pub fn with_page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Role) -> bool + Send + Sync + 'static,
    {
        self.predicates.push(Box::new(predicate));
        self
    }

    /// Whether `role` passes every filter.
    pub fn matches(&self, role: &Role) -> bool {
        let exact = |filter: &Option<String>, value: &str| filter.as_deref().map_or(true, |f| f == value);
        exact(&self.id, &role.id)
            && self.name.as_deref().map_or(true, |n| match_name(n, &role.name))
            && exact(&self.owner, &role.owner)
            && exact(&self.source, &role.source)
            && self.member.as_ref().map_or(true, |m| role.has_member(m))
            && self.predicates.iter().all(|predicate| predicate(role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyAction, PolicyRecord};

    #[test]
    fn test_match_name() {
        assert!(match_name("*", "anything"));
        assert!(match_name("svc-*", "svc-readers"));
        assert!(!match_name("svc-*", "ops"));
        assert!(match_name("ops", "ops"));
        assert!(!match_name("ops", "ops-2"));
    }

    #[test]
    fn test_paginate_newest_first() {
        let base = Utc::now();
        let items = vec![
            ("a", base),
            ("b", base + chrono::Duration::seconds(2)),
            ("c", base + chrono::Duration::seconds(1)),
        ];
        let (total, page) = paginate(items, |item| item.1, 1, Some(1));
        assert_eq!(total, 3);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].0, "c");
    }

    #[test]
    fn test_policy_query_owner_falls_back_to_principal() {
        let policy = PolicyRecord::new("p1", "shared", PolicyAction::Allow)
            .with_owner("alice")
            .with_principal(Principal::user("bob"));
        let detail = PolicyDetailCache::new(policy).unwrap();

        assert!(PolicyQuery::new().with_owner("alice").matches(&detail));
        assert!(!PolicyQuery::new().with_owner("bob").matches(&detail));
        assert!(PolicyQuery::new()
            .with_owner("bob")
            .with_principal(&Principal::user("bob"))
            .matches(&detail));
    }

    #[test]
    fn test_policy_query_predicates() {
        let policy = PolicyRecord::new("p1", "svc-readers", PolicyAction::Deny)
            .with_resource(ResourceType::Services, "svc-a");
        let detail = PolicyDetailCache::new(policy).unwrap();

        assert!(PolicyQuery::new()
            .with_name("svc-*")
            .with_resource(ResourceType::Services, "svc-a")
            .with_predicate(|p| p.action == PolicyAction::Deny)
            .matches(&detail));
        assert!(!PolicyQuery::new()
            .with_predicate(|p| p.action == PolicyAction::Allow)
            .matches(&detail));
        assert!(!PolicyQuery::new().with_default(true).matches(&detail));
    }

    #[test]
    fn test_role_query() {
        let role = Role::new("r1", "ops-admins")
            .with_owner("alice")
            .with_source("local")
            .with_group("g1");

        assert!(RoleQuery::new().with_name("ops*").with_source("local").matches(&role));
        assert!(RoleQuery::new().with_member(Principal::group("g1")).matches(&role));
        assert!(!RoleQuery::new().with_member(Principal::user("g1")).matches(&role));
        assert!(!RoleQuery::new().with_owner("bob").matches(&role));
    }
}
