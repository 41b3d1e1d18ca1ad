//! The role cache and its principal -> roles reverse index.

use crate::{
    cache::{Cache, CacheIndex, CacheOptions},
    error::{Error, Result},
    fold::{role_delta, RoleIndexDelta},
    metrics::CacheMetrics,
    principal::Principal,
    query::{paginate, RoleQuery},
    record::{max_modify_time, VersionedRecord},
    role::Role,
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

const SUB_ROLES: &str = "roles";

/// Role cache.
pub struct RoleCache {
    store: Arc<dyn Store>,
    roles: DashMap<String, Arc<Role>>,
    // role name -> role id
    names: DashMap<String, String>,
    principal_roles: DashMap<Principal, HashSet<String>>,
    sync: SyncState,
    flight: SingleFlight,
    metrics: CacheMetrics,
    closed: AtomicBool,
}

impl std::fmt::Debug for RoleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleCache")
            .field("roles", &self.roles.len())
            .field("principals", &self.principal_roles.len())
            .finish()
    }
}

impl RoleCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            roles: DashMap::new(),
            names: DashMap::new(),
            principal_roles: DashMap::new(),
            sync: SyncState::new(),
            flight: SingleFlight::new(),
            metrics: CacheMetrics::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn last_fetch_time(&self) -> DateTime<Utc> {
        self.sync.watermark(SUB_ROLES)
    }

    /// Look up a role by id.
    pub fn get_role(&self, id: &str) -> Option<Role> {
        self.roles.get(id).map(|role| role.as_ref().clone())
    }

    /// Look up a role by name.
    pub fn get_role_by_name(&self, name: &str) -> Option<Role> {
        let id = self.names.get(name).map(|id| id.clone())?;
        self.get_role(&id)
    }

    pub fn role_count(&self) -> usize {
        self.roles.len()
    }

    /// Roles `principal` is a direct member of.
    ///
    /// Role ids that no longer resolve are skipped.
    pub fn get_principal_roles(&self, principal: &Principal) -> Vec<Role> {
        let mut ids: Vec<String> = self
            .principal_roles
            .get(principal)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids.iter().filter_map(|id| self.get_role(id)).collect()
    }

    /// Refresh, then list roles matching `query`, newest first.
    pub async fn query(&self, query: &RoleQuery) -> Result<(usize, Vec<Role>)> {
        self.update().await?;
        let matched: Vec<Role> = self
            .roles
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| entry.value().as_ref().clone())
            .collect();
        Ok(paginate(matched, |r| r.modify_time, query.offset, query.limit))
    }

    /// Fold a batch of store records, then drop principal entries left
    /// without roles.
    pub fn fold_batch(&self, records: &[Role]) -> FoldOutcome {
        let mut outcome = FoldOutcome {
            newest: max_modify_time(records),
            ..FoldOutcome::default()
        };
        for role in records {
            if role.id.trim().is_empty() {
                let err = Error::invalid_record("role", role.name.clone(), "empty role id");
                log::warn!("[RoleCache] skipping role: {}", err);
                outcome.skipped += 1;
                continue;
            }
            self.fold_one(role);
            outcome.processed += 1;
        }
        self.clean_empty_principal_roles();
        outcome
    }

    fn fold_one(&self, role: &Role) {
        let old = self.roles.get(&role.id).map(|r| r.value().clone());
        let delta = role_delta(old.as_deref(), role);

        if let Some(old) = &old {
            if old.name != role.name || !role.is_valid() {
                self.names.remove_if(&old.name, |_, id| id == &old.id);
            }
        }
        if role.is_valid() {
            self.roles.insert(role.id.clone(), Arc::new(role.clone()));
            self.names.insert(role.name.clone(), role.id.clone());
        }
        self.apply_delta(&role.id, &delta);
        if !role.is_valid() {
            self.roles.remove(&role.id);
        }
    }

    fn apply_delta(&self, role_id: &str, delta: &RoleIndexDelta) {
        for principal in &delta.unlink {
            if let Some(mut ids) = self.principal_roles.get_mut(principal) {
                ids.remove(role_id);
            }
        }
        for principal in &delta.link {
            self.principal_roles
                .entry(principal.clone())
                .or_default()
                .insert(role_id.to_string());
        }
    }

    /// Remove principal entries whose role set became empty.
    pub fn clean_empty_principal_roles(&self) {
        self.principal_roles.retain(|_, ids| !ids.is_empty());
    }

    async fn real_update(&self) -> Result<()> {
        let _cycle = self.sync.lock_cycle().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed(self.name().to_string()));
        }
        let started = Instant::now();
        let outcome = self
            .store
            .get_more_roles(self.last_fetch_time(), self.sync.is_first_update())
            .await
            .map(|records| {
                let mut result = UpdateResult::default();
                result.absorb(SUB_ROLES, self.fold_batch(&records));
                result
            });
        self.sync.finish(self.name(), started, outcome, &self.metrics)
    }
}

#[async_trait::async_trait]
impl Cache for RoleCache {
    async fn initialize(&self, _options: &CacheOptions) -> Result<()> {
        self.closed.store(false, Ordering::Release);
        Ok(())
    }

    async fn update(&self) -> Result<()> {
        self.flight.run(self.name(), || self.real_update()).await
    }

    async fn clear(&self) -> Result<()> {
        let _cycle = self.sync.lock_cycle().await;
        self.roles.clear();
        self.names.clear();
        self.principal_roles.clear();
        self.sync.reset();
        Ok(())
    }

    fn name(&self) -> &str {
        CacheIndex::Roles.as_str()
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
    use crate::store::MemoryStore;

    fn cache() -> RoleCache {
        RoleCache::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_membership_moves_between_principals() {
        let cache = cache();
        cache.fold_batch(&[Role::new("r1", "ops").with_user("u1")]);
        cache.fold_batch(&[Role::new("r1", "ops").with_user("u2")]);

        assert!(cache.get_principal_roles(&Principal::user("u1")).is_empty());
        let roles = cache.get_principal_roles(&Principal::user("u2"));
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].id, "r1");
        assert!(!cache.principal_roles.contains_key(&Principal::user("u1")));
    }

    #[test]
    fn test_group_members_and_tombstone() {
        let cache = cache();
        let role = Role::new("r1", "ops").with_user("u1").with_group("g1");
        cache.fold_batch(&[role.clone(), Role::new("r2", "dev").with_group("g1")]);
        assert_eq!(cache.get_principal_roles(&Principal::group("g1")).len(), 2);

        cache.fold_batch(&[role.tombstone()]);
        assert!(cache.get_role("r1").is_none());
        assert!(cache.get_role_by_name("ops").is_none());
        let roles = cache.get_principal_roles(&Principal::group("g1"));
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].id, "r2");
        assert!(cache.get_principal_roles(&Principal::user("u1")).is_empty());
    }

    #[test]
    fn test_rename_updates_name_index() {
        let cache = cache();
        cache.fold_batch(&[Role::new("r1", "ops")]);
        cache.fold_batch(&[Role::new("r1", "sre")]);
        assert!(cache.get_role_by_name("ops").is_none());
        assert_eq!(cache.get_role_by_name("sre").map(|r| r.id), Some("r1".to_string()));
        assert_eq!(cache.role_count(), 1);
    }

    #[test]
    fn test_refold_is_idempotent() {
        let cache = cache();
        let batch = vec![
            Role::new("r1", "ops").with_user("u1"),
            Role::new("r1", "ops").with_user("u2"),
        ];
        cache.fold_batch(&batch);
        cache.fold_batch(&batch);
        assert!(cache.get_principal_roles(&Principal::user("u1")).is_empty());
        assert_eq!(cache.get_principal_roles(&Principal::user("u2")).len(), 1);
    }

    #[test]
    fn test_nameless_role_is_skipped() {
        let cache = cache();
        let outcome = cache.fold_batch(&[Role::new("", "broken"), Role::new("r1", "ok")]);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.processed, 1);
    }

    #[tokio::test]
    async fn test_update_and_query() {
        let store = Arc::new(MemoryStore::new());
        let cache = RoleCache::new(store.clone());
        store.put_role(Role::new("r1", "ops-a").with_source("local"));
        store.put_role(Role::new("r2", "ops-b").with_source("ldap").with_user("u1"));
        store.put_role(Role::new("r3", "dev"));

        let (total, page) = cache.query(&RoleQuery::new().with_name("ops*")).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(page[0].id, "r2");

        let (total, page) = cache
            .query(&RoleQuery::new().with_member(Principal::user("u1")))
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(page[0].source, "ldap");
    }
}
