//! Per-principal resource containment.
//!
//! A [`PrincipalResourceContainer`] answers "is resource R of type T allowed
//! or denied for this principal" without walking policies. Each
//! `(effect, resource type)` pair owns a [`RefSet`] that maps a resource id to
//! the set of policies referencing it, so one policy dropping a resource does
//! not evict an entry another policy still grants.

use crate::{
    policy::PolicyAction,
    resource::{ResourceType, StrategyResource, WILDCARD},
};
use dashmap::DashMap;
use std::collections::HashSet;

/// Reference-counted set of resource ids.
#[derive(Debug, Default)]
pub struct RefSet {
    // resource id -> referencing policy ids
    entries: DashMap<String, HashSet<String>>,
}

impl RefSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `referencer` references `key`. Idempotent.
    pub fn add(&self, key: &str, referencer: &str) {
        self.entries
            .entry(key.to_string())
            .or_default()
            .insert(referencer.to_string());
    }

    /// Drop `referencer`'s reference to `key`; the key leaves the set once
    /// nothing references it.
    pub fn remove(&self, key: &str, referencer: &str) {
        if let Some(mut refs) = self.entries.get_mut(key) {
            refs.remove(referencer);
            if refs.is_empty() {
                drop(refs);
                self.entries.remove_if(key, |_, refs| refs.is_empty());
            }
        }
    }

    /// Whether any policy references `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Policies referencing `key`.
    pub fn referencers(&self, key: &str) -> HashSet<String> {
        self.entries
            .get(key)
            .map(|refs| refs.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Allow/deny resource sets for one principal.
#[derive(Debug, Default)]
pub struct PrincipalResourceContainer {
    allow: DashMap<ResourceType, RefSet>,
    deny: DashMap<ResourceType, RefSet>,
}

impl PrincipalResourceContainer {
    /// Create an empty container.
    pub fn new() -> Self {
        Self::default()
    }

    fn side(&self, action: PolicyAction) -> &DashMap<ResourceType, RefSet> {
        match action {
            PolicyAction::Allow => &self.allow,
            PolicyAction::Deny => &self.deny,
        }
    }

    /// Link `resource` under `action`, referenced by its owning policy.
    pub fn save_resource(&self, action: PolicyAction, resource: &StrategyResource) {
        self.side(action)
            .entry(resource.res_type)
            .or_default()
            .add(&resource.res_id, &resource.strategy_id);
    }

    /// Unlink the owning policy's reference to `resource` under `action`.
    pub fn del_resource(&self, action: PolicyAction, resource: &StrategyResource) {
        let side = self.side(action);
        if let Some(set) = side.get(&resource.res_type) {
            set.remove(&resource.res_id, &resource.strategy_id);
            if set.is_empty() {
                drop(set);
                side.remove_if(&resource.res_type, |_, set| set.is_empty());
            }
        }
    }

    /// Explicit containment check.
    ///
    /// Order: deny wildcard, deny exact, allow wildcard, allow exact. Returns
    /// `None` when neither side mentions the resource.
    pub fn hint(&self, res_type: ResourceType, res_id: &str) -> Option<PolicyAction> {
        if Self::side_matches(&self.deny, res_type, res_id) {
            return Some(PolicyAction::Deny);
        }
        if Self::side_matches(&self.allow, res_type, res_id) {
            return Some(PolicyAction::Allow);
        }
        None
    }

    fn side_matches(side: &DashMap<ResourceType, RefSet>, res_type: ResourceType, res_id: &str) -> bool {
        match side.get(&res_type) {
            Some(set) => set.contains(WILDCARD) || set.contains(res_id),
            None => false,
        }
    }

    /// Policies referencing `res_id` (exactly, not via wildcard) under `action`.
    pub fn referencers(&self, action: PolicyAction, res_type: ResourceType, res_id: &str) -> HashSet<String> {
        self.side(action)
            .get(&res_type)
            .map(|set| set.referencers(res_id))
            .unwrap_or_default()
    }

    /// Whether neither side holds any resource.
    pub fn is_empty(&self) -> bool {
        self.allow.iter().all(|s| s.is_empty()) && self.deny.iter().all(|s| s.is_empty())
    }
}
