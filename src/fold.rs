//! Pure fold functions.
//!
//! Given the previously cached version of a record (if any) and the version
//! just delivered by the store, compute the exact set of reverse-index edits
//! that turn the old index state into the new one. Nothing here touches a
//! map; the caches apply the returned delta. Applying the same delta twice
//! leaves the index unchanged, which is what makes re-delivery of a delta
//! window after a failed update safe.

use crate::{
    policy::{PolicyAction, PolicyRecord},
    principal::Principal,
    record::{Lifecycle, VersionedRecord},
    resource::{ResourceType, StrategyResource},
    role::Role,
};
use std::collections::HashSet;
use std::hash::Hash;

/// One resource-containment edit for one principal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceLink {
    pub principal: Principal,
    pub action: PolicyAction,
    pub resource: StrategyResource,
}

/// Index edits produced by folding one policy record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyIndexDelta {
    /// `(principal, effect)` rule-id links to remove.
    pub unlink_principals: Vec<(Principal, PolicyAction)>,
    /// `(principal, effect)` rule-id links to add.
    pub link_principals: Vec<(Principal, PolicyAction)>,
    /// Containment entries to remove; applied before `add_resources`.
    pub remove_resources: Vec<ResourceLink>,
    /// Containment entries to add.
    pub add_resources: Vec<ResourceLink>,
    /// Whether the record stays in the primary map.
    pub lifecycle: Lifecycle,
}

impl PolicyIndexDelta {
    /// Whether applying this delta changes no reverse index.
    pub fn is_noop(&self) -> bool {
        self.unlink_principals.is_empty()
            && self.link_principals.is_empty()
            && self.remove_resources.is_empty()
            && self.add_resources.is_empty()
    }
}

fn owned_resources(policy: &PolicyRecord) -> Vec<StrategyResource> {
    policy
        .resources
        .iter()
        .map(|r| {
            let mut r = r.clone();
            r.strategy_id = policy.id.clone();
            r
        })
        .collect()
}

fn links(principal: &Principal, action: PolicyAction, resources: &[StrategyResource]) -> Vec<ResourceLink> {
    resources
        .iter()
        .map(|resource| ResourceLink {
            principal: principal.clone(),
            action,
            resource: resource.clone(),
        })
        .collect()
}

/// Compute the index edits for replacing `old` with `new`.
///
/// - principals dropped from the policy lose their rule-id link and every
///   containment entry the old version gave them;
/// - when the effect changed, every old link is removed under the old effect;
/// - otherwise only resources missing from the new version are removed;
/// - a valid `new` links all of its principals and resources under its
///   effect, a tombstone removes them instead.
pub fn policy_delta(old: Option<&PolicyRecord>, new: &PolicyRecord) -> PolicyIndexDelta {
    let lifecycle = new.lifecycle();
    let new_resources = owned_resources(new);

    let mut unlink_principals = Vec::new();
    let mut link_principals = Vec::new();
    let mut remove_resources = Vec::new();
    let mut add_resources = Vec::new();

    if let Some(old) = old {
        let old_resources = owned_resources(old);
        let action_changed = old.action != new.action;
        let retained: HashSet<&Principal> = if lifecycle.is_active() {
            new.principals.iter().collect()
        } else {
            HashSet::new()
        };
        let new_keys: HashSet<(ResourceType, &str)> =
            new_resources.iter().map(|r| r.diff_key()).collect();

        for principal in &old.principals {
            if action_changed || !retained.contains(principal) {
                unlink_principals.push((principal.clone(), old.action));
                remove_resources.extend(links(principal, old.action, &old_resources));
            } else {
                let dropped: Vec<StrategyResource> = old_resources
                    .iter()
                    .filter(|r| !new_keys.contains(&r.diff_key()))
                    .cloned()
                    .collect();
                remove_resources.extend(links(principal, old.action, &dropped));
            }
        }
    }

    for principal in &new.principals {
        if lifecycle.is_active() {
            link_principals.push((principal.clone(), new.action));
            add_resources.extend(links(principal, new.action, &new_resources));
        } else {
            unlink_principals.push((principal.clone(), new.action));
            remove_resources.extend(links(principal, new.action, &new_resources));
        }
    }

    PolicyIndexDelta {
        unlink_principals,
        link_principals,
        remove_resources,
        add_resources,
        lifecycle,
    }
}

/// Membership edits produced by folding one group-like record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipDelta<K> {
    /// Members whose link to the record must be removed.
    pub unlink: Vec<K>,
    /// Members whose link to the record must exist.
    pub link: Vec<K>,
    /// Whether the record stays in the primary map.
    pub lifecycle: Lifecycle,
}

/// Diff two member lists.
///
/// Members of `old` missing from `new` (all of them, if `new` is a
/// tombstone) are unlinked. Every member of an active `new` is linked; links
/// are set-valued so re-linking a retained member is harmless.
pub fn membership_delta<'a, K, O, N>(old: Option<O>, new: N, lifecycle: Lifecycle) -> MembershipDelta<K>
where
    K: Eq + Hash + Clone + 'a,
    O: IntoIterator<Item = &'a K>,
    N: IntoIterator<Item = &'a K>,
{
    let new: Vec<&K> = new.into_iter().collect();
    let keep: HashSet<&K> = if lifecycle.is_active() {
        new.iter().copied().collect()
    } else {
        HashSet::new()
    };

    let mut unlink: Vec<K> = Vec::new();
    if let Some(old) = old {
        unlink.extend(old.into_iter().filter(|m| !keep.contains(m)).cloned());
    }

    let link = if lifecycle.is_active() {
        new.into_iter().cloned().collect()
    } else {
        let mut seen: HashSet<K> = unlink.iter().cloned().collect();
        unlink.extend(new.into_iter().filter(|m| seen.insert((*m).clone())).cloned());
        Vec::new()
    };

    MembershipDelta {
        unlink,
        link,
        lifecycle,
    }
}

/// Membership edits of a role, keyed by member principal.
pub type RoleIndexDelta = MembershipDelta<Principal>;

/// Membership edits for replacing role `old` with `new`.
pub fn role_delta(old: Option<&Role>, new: &Role) -> RoleIndexDelta {
    membership_delta(old.map(|o| o.members()), new.members(), new.lifecycle())
}
