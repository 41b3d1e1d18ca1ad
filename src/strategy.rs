//! The policy (strategy) cache.
//!
//! Holds every live policy plus three reverse indexes maintained
//! incrementally by the fold:
//!
//! - principal -> allow policy ids
//! - principal -> deny policy ids
//! - principal -> [`PrincipalResourceContainer`]
//!
//! Reads go straight to the concurrent maps and never wait for an update.
//! A reader may see one policy's principal links change slightly before its
//! resource links; the window is bounded by a single record's fold.

use crate::{
    cache::{Cache, CacheIndex, CacheOptions},
    condition::{compile_all, match_all, CompiledCondition},
    container::PrincipalResourceContainer,
    context::RequestContext,
    error::{Error, Result},
    fold::{policy_delta, PolicyIndexDelta},
    metrics::CacheMetrics,
    policy::{PolicyAction, PolicyDetailCache, PolicyRecord},
    principal::Principal,
    query::{paginate, PolicyQuery},
    record::VersionedRecord,
    resource::ResourceEntry,
    store::Store,
    sync::{FoldOutcome, SingleFlight, SyncState, UpdateResult},
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Watermark key of the policy feed.
const SUB_STRATEGIES: &str = "strategies";

/// Policy cache with principal reverse indexes.
pub struct StrategyCache {
    store: Arc<dyn Store>,
    policies: DashMap<String, Arc<PolicyDetailCache>>,
    allow_policies: DashMap<Principal, HashSet<String>>,
    deny_policies: DashMap<Principal, HashSet<String>>,
    containers: DashMap<Principal, Arc<PrincipalResourceContainer>>,
    sync: SyncState,
    flight: SingleFlight,
    metrics: CacheMetrics,
    closed: AtomicBool,
}

impl std::fmt::Debug for StrategyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyCache")
            .field("policies", &self.policies.len())
            .field("principals", &self.containers.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl StrategyCache {
    /// Create an empty cache reading from `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            policies: DashMap::new(),
            allow_policies: DashMap::new(),
            deny_policies: DashMap::new(),
            containers: DashMap::new(),
            sync: SyncState::new(),
            flight: SingleFlight::new(),
            metrics: CacheMetrics::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Metrics of this cache.
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Current watermark of the policy feed.
    pub fn last_fetch_time(&self) -> DateTime<Utc> {
        self.sync.watermark(SUB_STRATEGIES)
    }

    /// Look up a policy by id.
    pub fn get_policy_rule(&self, id: &str) -> Option<PolicyRecord> {
        self.policies.get(id).map(|p| p.record().clone())
    }

    /// Number of live policies.
    pub fn policy_count(&self) -> usize {
        self.policies.len()
    }

    fn rule_index(&self, action: PolicyAction) -> &DashMap<Principal, HashSet<String>> {
        match action {
            PolicyAction::Allow => &self.allow_policies,
            PolicyAction::Deny => &self.deny_policies,
        }
    }

    fn rule_ids(&self, action: PolicyAction, principal: &Principal) -> Vec<String> {
        self.rule_index(action)
            .get(principal)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Policies linked to `principal`, for one effect or (with `None`) both.
    ///
    /// Ids that no longer resolve are skipped.
    pub fn get_principal_policies(
        &self,
        effect: Option<PolicyAction>,
        principal: &Principal,
    ) -> Vec<PolicyRecord> {
        let mut ids: Vec<String> = match effect {
            Some(action) => self.rule_ids(action, principal),
            None => {
                let mut ids: HashSet<String> =
                    self.rule_ids(PolicyAction::Allow, principal).into_iter().collect();
                ids.extend(self.rule_ids(PolicyAction::Deny, principal));
                ids.into_iter().collect()
            }
        };
        ids.sort();
        ids.iter()
            .filter_map(|id| self.get_policy_rule(id))
            .collect()
    }

    /// [`Self::get_principal_policies`] with the effect given as
    /// `"allow"`, `"deny"` or `""`.
    pub fn get_principal_policies_by_effect(
        &self,
        effect: &str,
        principal: &Principal,
    ) -> Result<Vec<PolicyRecord>> {
        let effect = PolicyAction::parse_effect(effect)?;
        Ok(self.get_principal_policies(effect, principal))
    }

    /// Whether any index still references `principal`.
    pub fn is_principal_linked(&self, principal: &Principal) -> bool {
        let linked = |index: &DashMap<Principal, HashSet<String>>| {
            index.get(principal).map(|ids| !ids.is_empty()).unwrap_or(false)
        };
        linked(&self.allow_policies) || linked(&self.deny_policies)
    }

    /// Authorization decision for `principal` acting on `resource`.
    ///
    /// Explicit resource containment is consulted first, then policy
    /// conditions. Deny wins at every stage and anything undecided is DENY.
    pub fn hint(
        &self,
        ctx: &RequestContext,
        principal: &Principal,
        resource: &ResourceEntry,
    ) -> PolicyAction {
        let decision = self.decide(ctx, principal, resource);
        self.metrics.record_hint(decision);
        log::trace!(
            "[StrategyCache] hint {} on {:?}/{} -> {}",
            principal,
            resource.res_type,
            resource.id,
            decision
        );
        decision
    }

    fn decide(
        &self,
        ctx: &RequestContext,
        principal: &Principal,
        resource: &ResourceEntry,
    ) -> PolicyAction {
        let container = match self.containers.get(principal) {
            Some(container) => container.value().clone(),
            None => return PolicyAction::Deny,
        };

        if let Some(res_type) = resource.res_type {
            if let Some(action) = container.hint(res_type, &resource.id) {
                return action;
            }
        }

        let ambient = match compile_all("request-context", ctx.conditions()) {
            Ok(conditions) => conditions,
            Err(err) => {
                log::debug!("[StrategyCache] ignoring request conditions: {}", err);
                Vec::new()
            }
        };

        if self.any_condition_hit(PolicyAction::Deny, principal, &ambient, resource) {
            return PolicyAction::Deny;
        }
        if self.any_condition_hit(PolicyAction::Allow, principal, &ambient, resource) {
            return PolicyAction::Allow;
        }
        PolicyAction::Deny
    }

    fn any_condition_hit(
        &self,
        action: PolicyAction,
        principal: &Principal,
        ambient: &[CompiledCondition],
        resource: &ResourceEntry,
    ) -> bool {
        self.rule_ids(action, principal)
            .iter()
            .filter_map(|id| self.policies.get(id).map(|p| p.value().clone()))
            .any(|policy| {
                let conditions = if policy.conditions().is_empty() {
                    ambient
                } else {
                    policy.conditions()
                };
                match_all(conditions, resource)
            })
    }

    /// Refresh, then list policies matching `query`, newest first.
    ///
    /// Returns the total match count and the requested page.
    pub async fn query(&self, query: &PolicyQuery) -> Result<(usize, Vec<PolicyRecord>)> {
        self.update().await?;
        let matched: Vec<PolicyRecord> = self
            .policies
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| entry.record().clone())
            .collect();
        Ok(paginate(matched, |p| p.modify_time, query.offset, query.limit))
    }

    /// Fold a batch of store records into the indexes, then sweep entries
    /// left empty. Safe to call again with the same batch.
    pub fn fold_batch(&self, records: &[PolicyRecord]) -> FoldOutcome {
        let mut outcome = FoldOutcome {
            newest: crate::record::max_modify_time(records),
            ..FoldOutcome::default()
        };
        for record in records {
            match self.fold_one(record.clone()) {
                Ok(()) => outcome.processed += 1,
                Err(err) => {
                    log::warn!("[StrategyCache] skipping policy '{}': {}", record.id, err);
                    outcome.skipped += 1;
                }
            }
        }
        self.sweep();
        outcome
    }

    fn fold_one(&self, mut record: PolicyRecord) -> Result<()> {
        record.normalize();
        let old = self.policies.get(&record.id).map(|p| p.value().clone());

        if !record.is_valid() {
            let delta = policy_delta(old.as_ref().map(|o| o.record()), &record);
            self.apply_delta(&record.id, &delta);
            self.policies.remove(&record.id);
            return Ok(());
        }

        let detail = match PolicyDetailCache::new(record) {
            Ok(detail) => Arc::new(detail),
            Err(err) => {
                // a policy that can no longer be evaluated must not keep granting
                if let Some(old) = old {
                    let tombstone = old.record().clone().tombstone();
                    let delta = policy_delta(Some(old.record()), &tombstone);
                    self.apply_delta(old.id(), &delta);
                    self.policies.remove(old.id());
                }
                return Err(err);
            }
        };

        let delta = policy_delta(old.as_ref().map(|o| o.record()), detail.record());
        self.policies
            .insert(detail.id().to_string(), detail.clone());
        self.apply_delta(detail.id(), &delta);
        Ok(())
    }

    fn container(&self, principal: &Principal) -> Arc<PrincipalResourceContainer> {
        self.containers
            .entry(principal.clone())
            .or_default()
            .value()
            .clone()
    }

    fn apply_delta(&self, policy_id: &str, delta: &PolicyIndexDelta) {
        if delta.is_noop() {
            log::trace!("[StrategyCache] policy '{}' links no principal", policy_id);
            return;
        }
        for (principal, action) in &delta.unlink_principals {
            if let Some(mut ids) = self.rule_index(*action).get_mut(principal) {
                ids.remove(policy_id);
            }
        }
        for link in &delta.remove_resources {
            if let Some(container) = self.containers.get(&link.principal).map(|c| c.value().clone()) {
                container.del_resource(link.action, &link.resource);
            }
        }
        for (principal, action) in &delta.link_principals {
            self.rule_index(*action)
                .entry(principal.clone())
                .or_default()
                .insert(policy_id.to_string());
            self.container(principal);
        }
        for link in &delta.add_resources {
            self.container(&link.principal)
                .save_resource(link.action, &link.resource);
        }
    }

    /// Drop rule-id sets that became empty, and containers that hold no
    /// resource and whose principal no policy links any more.
    pub fn sweep(&self) {
        self.allow_policies.retain(|_, ids| !ids.is_empty());
        self.deny_policies.retain(|_, ids| !ids.is_empty());
        self.containers
            .retain(|principal, container| !container.is_empty() || self.is_principal_linked(principal));
    }

    async fn real_update(&self) -> Result<()> {
        let _cycle = self.sync.lock_cycle().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed(self.name().to_string()));
        }
        let started = Instant::now();
        let outcome = self
            .store
            .get_more_strategies(self.last_fetch_time(), self.sync.is_first_update())
            .await
            .map(|records| {
                let mut result = UpdateResult::default();
                result.absorb(SUB_STRATEGIES, self.fold_batch(&records));
                result
            });
        self.sync
            .finish(self.name(), started, outcome, &self.metrics)
    }
}

#[async_trait::async_trait]
impl Cache for StrategyCache {
    async fn initialize(&self, options: &CacheOptions) -> Result<()> {
        self.closed.store(false, Ordering::Release);
        log::debug!("[StrategyCache] initialized with {:?}", options);
        Ok(())
    }

    async fn update(&self) -> Result<()> {
        self.flight
            .run(self.name(), || self.real_update())
            .await
    }

    async fn clear(&self) -> Result<()> {
        let _cycle = self.sync.lock_cycle().await;
        self.policies.clear();
        self.allow_policies.clear();
        self.deny_policies.clear();
        self.containers.clear();
        self.sync.reset();
        Ok(())
    }

    fn name(&self) -> &str {
        CacheIndex::StrategyRule.as_str()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        condition::Condition,
        resource::{ResourceType, WILDCARD},
        store::MemoryStore,
    };

    fn cache() -> StrategyCache {
        StrategyCache::new(Arc::new(MemoryStore::new()))
    }

    fn svc(id: &str) -> ResourceEntry {
        ResourceEntry::new(ResourceType::Services, id)
    }

    #[test]
    fn test_deny_overrides_wildcard_allow() {
        let cache = cache();
        let u1 = Principal::user("u1");
        cache.fold_batch(&[
            PolicyRecord::new("p1", "all-services", PolicyAction::Allow)
                .with_principal(u1.clone())
                .with_resource(ResourceType::Services, WILDCARD),
            PolicyRecord::new("p2", "no-svc-a", PolicyAction::Deny)
                .with_principal(u1.clone())
                .with_resource(ResourceType::Services, "svcA"),
        ]);

        let ctx = RequestContext::new();
        assert_eq!(cache.hint(&ctx, &u1, &svc("svcA")), PolicyAction::Deny);
        assert_eq!(cache.hint(&ctx, &u1, &svc("svcB")), PolicyAction::Allow);
        assert_eq!(cache.metrics().snapshot().hint_allows, 1);
    }

    #[test]
    fn test_unknown_principal_is_denied() {
        let cache = cache();
        let ctx = RequestContext::new();
        assert_eq!(
            cache.hint(&ctx, &Principal::user("ghost"), &svc("svcA")),
            PolicyAction::Deny
        );
    }

    #[test]
    fn test_principal_diff_on_update() {
        let cache = cache();
        let base = PolicyRecord::new("p1", "readers", PolicyAction::Allow)
            .with_resource(ResourceType::Namespaces, "default");
        cache.fold_batch(&[base
            .clone()
            .with_principal(Principal::user("u1"))
            .with_principal(Principal::user("u2"))]);
        cache.fold_batch(&[base
            .with_principal(Principal::user("u2"))
            .with_principal(Principal::user("u3"))]);

        assert!(cache.get_principal_policies(None, &Principal::user("u1")).is_empty());
        assert_eq!(cache.get_principal_policies(None, &Principal::user("u2")).len(), 1);
        assert_eq!(
            cache
                .get_principal_policies(Some(PolicyAction::Allow), &Principal::user("u3"))
                .len(),
            1
        );
        assert!(!cache.is_principal_linked(&Principal::user("u1")));

        let ctx = RequestContext::new();
        let ns = ResourceEntry::new(ResourceType::Namespaces, "default");
        assert_eq!(cache.hint(&ctx, &Principal::user("u1"), &ns), PolicyAction::Deny);
        assert_eq!(cache.hint(&ctx, &Principal::user("u3"), &ns), PolicyAction::Allow);
    }

    #[test]
    fn test_tombstone_removes_policy_everywhere() {
        let cache = cache();
        let u1 = Principal::user("u1");
        let keep = PolicyRecord::new("keep", "keep", PolicyAction::Allow)
            .with_principal(u1.clone())
            .with_resource(ResourceType::Services, "svcA");
        let gone = PolicyRecord::new("gone", "gone", PolicyAction::Allow)
            .with_principal(u1.clone())
            .with_resource(ResourceType::Services, "svcB");
        cache.fold_batch(&[keep, gone.clone()]);
        cache.fold_batch(&[gone.tombstone()]);

        let ctx = RequestContext::new();
        assert!(cache.get_policy_rule("gone").is_none());
        assert_eq!(cache.get_principal_policies(None, &u1).len(), 1);
        assert_eq!(cache.hint(&ctx, &u1, &svc("svcB")), PolicyAction::Deny);
        assert_eq!(cache.hint(&ctx, &u1, &svc("svcA")), PolicyAction::Allow);
    }

    #[test]
    fn test_effect_change_moves_links() {
        let cache = cache();
        let u1 = Principal::user("u1");
        let policy = PolicyRecord::new("p1", "flip", PolicyAction::Allow)
            .with_principal(u1.clone())
            .with_resource(ResourceType::Services, "svcA");
        cache.fold_batch(&[policy.clone()]);

        let mut flipped = policy;
        flipped.action = PolicyAction::Deny;
        cache.fold_batch(&[flipped]);

        assert!(cache
            .get_principal_policies(Some(PolicyAction::Allow), &u1)
            .is_empty());
        assert_eq!(
            cache.get_principal_policies(Some(PolicyAction::Deny), &u1).len(),
            1
        );
        assert_eq!(
            cache.hint(&RequestContext::new(), &u1, &svc("svcA")),
            PolicyAction::Deny
        );
    }

    #[test]
    fn test_condition_fallback() {
        let cache = cache();
        let u1 = Principal::user("u1");
        cache.fold_batch(&[
            PolicyRecord::new("p1", "prod-only", PolicyAction::Allow)
                .with_principal(u1.clone())
                .with_condition(Condition::string_equal("env", "prod")),
            PolicyRecord::new("p2", "no-secrets", PolicyAction::Deny)
                .with_principal(u1.clone())
                .with_condition(Condition::new("tier", "for_any_value:string_equal_ignore_case", "SECRET")),
        ]);

        let ctx = RequestContext::new();
        let prod = svc("svcA").with_metadata("env", "prod");
        let secret = svc("svcB").with_metadata("env", "prod").with_metadata("tier", "secret");
        let dev = svc("svcC").with_metadata("env", "dev");
        assert_eq!(cache.hint(&ctx, &u1, &prod), PolicyAction::Allow);
        assert_eq!(cache.hint(&ctx, &u1, &secret), PolicyAction::Deny);
        assert_eq!(cache.hint(&ctx, &u1, &dev), PolicyAction::Deny);
    }

    #[test]
    fn test_ambient_conditions_apply_to_condition_free_policies() {
        let cache = cache();
        let u1 = Principal::user("u1");
        cache.fold_batch(&[PolicyRecord::new("p1", "bare", PolicyAction::Allow)
            .with_principal(u1.clone())
            .with_resource(ResourceType::Namespaces, "default")]);

        let entry = svc("svcA").with_metadata("team", "edge");
        assert_eq!(cache.hint(&RequestContext::new(), &u1, &entry), PolicyAction::Deny);

        let ctx = RequestContext::new().with_condition(Condition::string_equal("team", "edge"));
        assert_eq!(cache.hint(&ctx, &u1, &entry), PolicyAction::Allow);
    }

    #[test]
    fn test_bad_record_is_skipped_and_evicts_previous_version() {
        let cache = cache();
        let u1 = Principal::user("u1");
        let good = PolicyRecord::new("p1", "ok", PolicyAction::Allow)
            .with_principal(u1.clone())
            .with_resource(ResourceType::Services, "svcA");
        let other = PolicyRecord::new("p2", "other", PolicyAction::Allow)
            .with_principal(u1.clone())
            .with_resource(ResourceType::Services, "svcB");
        cache.fold_batch(&[good.clone()]);

        let broken = good.with_condition(Condition::new("env", "regex", "pr.*"));
        let outcome = cache.fold_batch(&[broken, other]);
        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.skipped, 1);
        assert!(cache.get_policy_rule("p1").is_none());
        assert!(cache.get_policy_rule("p2").is_some());
        assert_eq!(
            cache.hint(&RequestContext::new(), &u1, &svc("svcA")),
            PolicyAction::Deny
        );
    }

    #[test]
    fn test_refold_is_idempotent_and_sweeps() {
        let cache = cache();
        let g1 = Principal::group("g1");
        let batch = vec![
            PolicyRecord::new("p1", "a", PolicyAction::Allow)
                .with_principal(g1.clone())
                .with_resource(ResourceType::Services, "svcA"),
            PolicyRecord::new("p1", "a", PolicyAction::Allow).tombstone(),
        ];
        cache.fold_batch(&batch);
        cache.fold_batch(&batch);

        assert_eq!(cache.policy_count(), 0);
        assert!(!cache.is_principal_linked(&g1));
        assert!(cache.containers.is_empty());
        assert!(cache.allow_policies.is_empty());
    }

    #[test]
    fn test_policy_without_principals_touches_no_index() {
        let cache = cache();
        cache.fold_batch(&[PolicyRecord::new("p1", "orphan", PolicyAction::Deny)
            .with_resource(ResourceType::Services, WILDCARD)]);

        assert_eq!(cache.policy_count(), 1);
        assert!(cache.get_policy_rule("p1").is_some());
        assert!(cache.containers.is_empty());
        assert!(cache.deny_policies.is_empty());
    }

    #[tokio::test]
    async fn test_update_and_query() {
        let store = Arc::new(MemoryStore::new());
        let cache = StrategyCache::new(store.clone());
        store.put_policy(
            PolicyRecord::new("p1", "svc-readers", PolicyAction::Allow)
                .with_owner("alice")
                .with_principal(Principal::user("u1")),
        );
        store.put_policy(PolicyRecord::new("p2", "svc-writers", PolicyAction::Allow).with_owner("alice"));
        store.put_policy(PolicyRecord::new("p3", "ops", PolicyAction::Deny).with_owner("bob"));

        let (total, page) = cache
            .query(&PolicyQuery::new().with_name("svc-*").with_page(0, 1))
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(page[0].id, "p2");
        assert!(cache.last_fetch_time() > crate::record::epoch());

        store.delete_policy("p2");
        let (total, _) = cache
            .query(&PolicyQuery::new().with_owner("alice"))
            .await
            .unwrap();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_closed_cache_rejects_updates() {
        let cache = cache();
        cache.close().await.unwrap();
        assert!(matches!(cache.update().await, Err(Error::Closed(_))));
        cache.initialize(&CacheOptions::default()).await.unwrap();
        assert!(cache.update().await.is_ok());
    }
}
