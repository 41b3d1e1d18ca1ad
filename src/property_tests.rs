//! Property-based tests for the policy and role indexes.
//!
//! These use `proptest` to drive the fold with arbitrary batches and check
//! the guarantees readers depend on.

#[cfg(test)]
mod tests {
    use crate::{
        context::RequestContext,
        fold::role_delta,
        policy::{PolicyAction, PolicyRecord},
        principal::Principal,
        resource::{normalize_resources, ResourceEntry, ResourceType, StrategyResource, WILDCARD},
        role::Role,
        store::MemoryStore,
        strategy::StrategyCache,
    };
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    const USERS: [&str; 4] = ["u0", "u1", "u2", "u3"];
    const SERVICES: [&str; 4] = ["s0", "s1", "s2", "s3"];

    fn cache() -> StrategyCache {
        StrategyCache::new(Arc::new(MemoryStore::new()))
    }

    fn action_strategy() -> impl Strategy<Value = PolicyAction> {
        prop_oneof![Just(PolicyAction::Allow), Just(PolicyAction::Deny)]
    }

    /// Resource ids drawn from a small pool so policies overlap.
    fn res_id_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            4 => prop::sample::select(SERVICES.to_vec()).prop_map(str::to_string),
            1 => Just(WILDCARD.to_string()),
        ]
    }

    fn user_set_strategy() -> impl Strategy<Value = Vec<String>> {
        prop::sample::subsequence(USERS.to_vec(), 0..=USERS.len())
            .prop_map(|users| users.into_iter().map(str::to_string).collect())
    }

    fn policy_strategy(id: String) -> impl Strategy<Value = PolicyRecord> {
        (
            action_strategy(),
            user_set_strategy(),
            prop::collection::vec(res_id_strategy(), 0..4),
        )
            .prop_map(move |(action, users, resources)| {
                let mut policy = PolicyRecord::new(id.clone(), id.clone(), action);
                for user in users {
                    policy = policy.with_principal(Principal::user(user));
                }
                for res_id in resources {
                    policy = policy.with_resource(ResourceType::Services, res_id);
                }
                policy
            })
    }

    fn batch_strategy() -> impl Strategy<Value = Vec<PolicyRecord>> {
        (1usize..6).prop_flat_map(|n| {
            (0..n)
                .map(|i| policy_strategy(format!("p{i}")))
                .collect::<Vec<_>>()
        })
    }

    /// Every (user, service) decision the cache would make.
    fn decisions(cache: &StrategyCache) -> Vec<PolicyAction> {
        let ctx = RequestContext::new();
        USERS
            .iter()
            .flat_map(|u| SERVICES.iter().map(move |s| (*u, *s)))
            .map(|(u, s)| {
                cache.hint(
                    &ctx,
                    &Principal::user(u),
                    &ResourceEntry::new(ResourceType::Services, s),
                )
            })
            .collect()
    }

    proptest! {
        #[test]
        fn prop_refold_is_idempotent(batch in batch_strategy()) {
            let cache = cache();
            cache.fold_batch(&batch);
            let first = decisions(&cache);
            let count = cache.policy_count();

            cache.fold_batch(&batch);
            prop_assert_eq!(decisions(&cache), first);
            prop_assert_eq!(cache.policy_count(), count);
        }

        #[test]
        fn prop_deny_overrides_allow(
            allowed in prop::collection::vec(res_id_strategy(), 1..4),
            denied in prop::collection::vec(res_id_strategy(), 1..4),
        ) {
            let cache = cache();
            let user = Principal::user("u0");
            let mut allow = PolicyRecord::new("allow", "allow", PolicyAction::Allow)
                .with_principal(user.clone());
            for id in &allowed {
                allow = allow.with_resource(ResourceType::Services, id.clone());
            }
            let mut deny = PolicyRecord::new("deny", "deny", PolicyAction::Deny)
                .with_principal(user.clone());
            for id in &denied {
                deny = deny.with_resource(ResourceType::Services, id.clone());
            }
            cache.fold_batch(&[allow, deny]);

            let deny_all = denied.iter().any(|id| id == WILDCARD);
            for service in SERVICES {
                let decision = cache.hint(
                    &RequestContext::new(),
                    &user,
                    &ResourceEntry::new(ResourceType::Services, service),
                );
                if deny_all || denied.iter().any(|id| id == service) {
                    prop_assert_eq!(decision, PolicyAction::Deny);
                }
            }
        }

        #[test]
        fn prop_tombstones_unlink_everything(batch in batch_strategy()) {
            let cache = cache();
            cache.fold_batch(&batch);
            let tombstones: Vec<PolicyRecord> =
                batch.iter().cloned().map(PolicyRecord::tombstone).collect();
            cache.fold_batch(&tombstones);

            prop_assert_eq!(cache.policy_count(), 0);
            for user in USERS {
                let principal = Principal::user(user);
                prop_assert!(!cache.is_principal_linked(&principal));
                prop_assert!(cache.get_principal_policies(None, &principal).is_empty());
            }
            prop_assert!(decisions(&cache).iter().all(|d| *d == PolicyAction::Deny));
        }

        #[test]
        fn prop_shared_resource_survives_one_referencer(extra in res_id_strategy()) {
            let cache = cache();
            let user = Principal::user("u0");
            let p1 = PolicyRecord::new("p1", "p1", PolicyAction::Allow)
                .with_principal(user.clone())
                .with_resource(ResourceType::Services, "s0");
            let p2 = PolicyRecord::new("p2", "p2", PolicyAction::Allow)
                .with_principal(user.clone())
                .with_resource(ResourceType::Services, "s0")
                .with_resource(ResourceType::Services, extra);
            cache.fold_batch(&[p1.clone(), p2.clone()]);
            cache.fold_batch(&[p2.tombstone()]);

            let s0 = ResourceEntry::new(ResourceType::Services, "s0");
            prop_assert_eq!(cache.hint(&RequestContext::new(), &user, &s0), PolicyAction::Allow);

            cache.fold_batch(&[p1.tombstone()]);
            prop_assert_eq!(cache.hint(&RequestContext::new(), &user, &s0), PolicyAction::Deny);
        }

        #[test]
        fn prop_principal_diff_unlinks_dropped(
            before in user_set_strategy(),
            after in user_set_strategy(),
        ) {
            let cache = cache();
            let build = |users: &[String]| {
                users.iter().fold(
                    PolicyRecord::new("p1", "p1", PolicyAction::Allow)
                        .with_resource(ResourceType::Services, "s0"),
                    |policy, user| policy.with_principal(Principal::user(user.clone())),
                )
            };
            cache.fold_batch(&[build(&before)]);
            cache.fold_batch(&[build(&after)]);

            for user in USERS {
                let principal = Principal::user(user);
                let expected = after.iter().any(|u| u == user);
                prop_assert_eq!(cache.is_principal_linked(&principal), expected);
            }
        }

        #[test]
        fn prop_normalize_leaves_unique_entries(
            ids in prop::collection::vec(res_id_strategy(), 0..8),
        ) {
            let mut resources: Vec<StrategyResource> = ids
                .iter()
                .map(|id| StrategyResource::new("p1", ResourceType::Services, id.clone()))
                .collect();
            normalize_resources(&mut resources);

            let keys: HashSet<&str> = resources.iter().map(|r| r.res_id.as_str()).collect();
            prop_assert_eq!(keys.len(), resources.len());
            if ids.iter().any(|id| id == WILDCARD) {
                prop_assert_eq!(resources.len(), 1);
                prop_assert!(resources[0].is_wildcard());
            }
        }

        #[test]
        fn prop_role_delta_links_exactly_new_members(
            before in user_set_strategy(),
            after in user_set_strategy(),
        ) {
            let build = |users: &[String]| {
                users.iter().fold(Role::new("r1", "ops"), |role, user| role.with_user(user.clone()))
            };
            let old = build(&before);
            let new = build(&after);
            let delta = role_delta(Some(&old), &new);

            let linked: HashSet<&Principal> = delta.link.iter().collect();
            let expected: HashSet<&Principal> = new.members().collect();
            prop_assert_eq!(linked, expected);
            for principal in &delta.unlink {
                prop_assert!(old.has_member(principal));
                prop_assert!(!new.has_member(principal));
            }
        }
    }
}
