//! The backing store the caches pull deltas from.

use crate::{
    error::{Error, Result},
    namespace::Namespace,
    policy::PolicyRecord,
    record::VersionedRecord,
    role::Role,
    service::Service,
    user::{User, UserGroup},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Source of record deltas.
///
/// With `first_update` set a method returns the full live set. Otherwise it
/// returns every record, tombstones included, modified strictly after
/// `last_fetch_time`.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn get_more_strategies(
        &self,
        last_fetch_time: DateTime<Utc>,
        first_update: bool,
    ) -> Result<Vec<PolicyRecord>>;

    async fn get_more_roles(
        &self,
        last_fetch_time: DateTime<Utc>,
        first_update: bool,
    ) -> Result<Vec<Role>>;

    async fn get_more_users(
        &self,
        last_fetch_time: DateTime<Utc>,
        first_update: bool,
    ) -> Result<Vec<User>>;

    async fn get_more_groups(
        &self,
        last_fetch_time: DateTime<Utc>,
        first_update: bool,
    ) -> Result<Vec<UserGroup>>;

    async fn get_more_namespaces(
        &self,
        last_fetch_time: DateTime<Utc>,
        first_update: bool,
    ) -> Result<Vec<Namespace>>;

    async fn get_more_services(
        &self,
        last_fetch_time: DateTime<Utc>,
        first_update: bool,
    ) -> Result<Vec<Service>>;
}

/// In-memory store using DashMap for thread safety.
///
/// Deletes are soft: the record stays behind as a tombstone with a fresh
/// modify time so that incremental readers observe the removal.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    strategies: Arc<DashMap<String, PolicyRecord>>,
    roles: Arc<DashMap<String, Role>>,
    users: Arc<DashMap<String, User>>,
    groups: Arc<DashMap<String, UserGroup>>,
    namespaces: Arc<DashMap<String, Namespace>>,
    services: Arc<DashMap<String, Service>>,
    clock: Arc<Mutex<DateTime<Utc>>>,
    pending_failures: Arc<AtomicUsize>,
    fetches: Arc<AtomicU64>,
    latency: Option<Duration>,
}

fn delta<R: VersionedRecord + Clone>(
    map: &DashMap<String, R>,
    last_fetch_time: DateTime<Utc>,
    first_update: bool,
) -> Vec<R> {
    map.iter()
        .filter(|entry| {
            if first_update {
                entry.is_valid()
            } else {
                entry.modify_time() > last_fetch_time
            }
        })
        .map(|entry| entry.value().clone())
        .collect()
}

fn ensure_id(id: &mut String) {
    if id.trim().is_empty() {
        *id = uuid::Uuid::new_v4().simple().to_string();
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every fetch by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make the next `count` fetches fail with [`Error::Store`].
    pub fn inject_failures(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Number of fetch calls served so far, failed ones included.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    // Modify times handed out are strictly increasing, so two writes never
    // share a watermark.
    fn next_modify_time(&self) -> DateTime<Utc> {
        let mut last = self
            .clock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut now = Utc::now();
        if now <= *last {
            now = *last + ChronoDuration::microseconds(1);
        }
        *last = now;
        now
    }

    async fn begin_fetch(&self, what: &str) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Store(format!("injected failure fetching {what}")));
        }
        Ok(())
    }

    /// Insert or replace a policy. Resources are normalized and re-owned by
    /// the policy; an empty id is replaced by a generated one.
    pub fn put_policy(&self, mut policy: PolicyRecord) -> PolicyRecord {
        ensure_id(&mut policy.id);
        for resource in &mut policy.resources {
            resource.strategy_id = policy.id.clone();
        }
        policy.normalize();
        policy.valid = true;
        policy.modify_time = self.next_modify_time();
        if let Some(existing) = self.strategies.get(&policy.id) {
            policy.create_time = existing.create_time;
        }
        self.strategies.insert(policy.id.clone(), policy.clone());
        policy
    }

    /// Tombstone a policy. Returns false if it was unknown.
    pub fn delete_policy(&self, id: &str) -> bool {
        let modify_time = self.next_modify_time();
        match self.strategies.get_mut(id) {
            Some(mut policy) => {
                policy.valid = false;
                policy.modify_time = modify_time;
                true
            }
            None => false,
        }
    }

    pub fn put_role(&self, mut role: Role) -> Role {
        ensure_id(&mut role.id);
        role.valid = true;
        role.modify_time = self.next_modify_time();
        self.roles.insert(role.id.clone(), role.clone());
        role
    }

    pub fn delete_role(&self, id: &str) -> bool {
        let modify_time = self.next_modify_time();
        match self.roles.get_mut(id) {
            Some(mut role) => {
                role.valid = false;
                role.modify_time = modify_time;
                true
            }
            None => false,
        }
    }

    pub fn put_user(&self, mut user: User) -> User {
        ensure_id(&mut user.id);
        user.valid = true;
        user.modify_time = self.next_modify_time();
        self.users.insert(user.id.clone(), user.clone());
        user
    }

    pub fn delete_user(&self, id: &str) -> bool {
        let modify_time = self.next_modify_time();
        match self.users.get_mut(id) {
            Some(mut user) => {
                user.valid = false;
                user.modify_time = modify_time;
                true
            }
            None => false,
        }
    }

    pub fn put_group(&self, mut group: UserGroup) -> UserGroup {
        ensure_id(&mut group.id);
        group.valid = true;
        group.modify_time = self.next_modify_time();
        self.groups.insert(group.id.clone(), group.clone());
        group
    }

    pub fn delete_group(&self, id: &str) -> bool {
        let modify_time = self.next_modify_time();
        match self.groups.get_mut(id) {
            Some(mut group) => {
                group.valid = false;
                group.modify_time = modify_time;
                true
            }
            None => false,
        }
    }

    pub fn put_namespace(&self, mut namespace: Namespace) -> Namespace {
        namespace.valid = true;
        namespace.modify_time = self.next_modify_time();
        self.namespaces
            .insert(namespace.name.clone(), namespace.clone());
        namespace
    }

    pub fn delete_namespace(&self, name: &str) -> bool {
        let modify_time = self.next_modify_time();
        match self.namespaces.get_mut(name) {
            Some(mut namespace) => {
                namespace.valid = false;
                namespace.modify_time = modify_time;
                true
            }
            None => false,
        }
    }

    pub fn put_service(&self, mut service: Service) -> Service {
        ensure_id(&mut service.id);
        service.valid = true;
        service.modify_time = self.next_modify_time();
        self.services.insert(service.id.clone(), service.clone());
        service
    }

    pub fn delete_service(&self, id: &str) -> bool {
        let modify_time = self.next_modify_time();
        match self.services.get_mut(id) {
            Some(mut service) => {
                service.valid = false;
                service.modify_time = modify_time;
                true
            }
            None => false,
        }
    }

    /// Number of stored policies, tombstones included.
    pub fn policy_count(&self) -> usize {
        self.strategies.len()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get_more_strategies(
        &self,
        last_fetch_time: DateTime<Utc>,
        first_update: bool,
    ) -> Result<Vec<PolicyRecord>> {
        self.begin_fetch("strategies").await?;
        Ok(delta(&self.strategies, last_fetch_time, first_update))
    }

    async fn get_more_roles(
        &self,
        last_fetch_time: DateTime<Utc>,
        first_update: bool,
    ) -> Result<Vec<Role>> {
        self.begin_fetch("roles").await?;
        Ok(delta(&self.roles, last_fetch_time, first_update))
    }

    async fn get_more_users(
        &self,
        last_fetch_time: DateTime<Utc>,
        first_update: bool,
    ) -> Result<Vec<User>> {
        self.begin_fetch("users").await?;
        Ok(delta(&self.users, last_fetch_time, first_update))
    }

    async fn get_more_groups(
        &self,
        last_fetch_time: DateTime<Utc>,
        first_update: bool,
    ) -> Result<Vec<UserGroup>> {
        self.begin_fetch("groups").await?;
        Ok(delta(&self.groups, last_fetch_time, first_update))
    }

    async fn get_more_namespaces(
        &self,
        last_fetch_time: DateTime<Utc>,
        first_update: bool,
    ) -> Result<Vec<Namespace>> {
        self.begin_fetch("namespaces").await?;
        Ok(delta(&self.namespaces, last_fetch_time, first_update))
    }

    async fn get_more_services(
        &self,
        last_fetch_time: DateTime<Utc>,
        first_update: bool,
    ) -> Result<Vec<Service>> {
        self.begin_fetch("services").await?;
        Ok(delta(&self.services, last_fetch_time, first_update))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        policy::PolicyAction,
        principal::Principal,
        record::epoch,
        resource::{ResourceType, WILDCARD},
    };

    #[tokio::test]
    async fn test_first_update_returns_live_set() {
        let store = MemoryStore::new();
        store.put_role(Role::new("r1", "ops"));
        store.put_role(Role::new("r2", "dev"));
        store.delete_role("r2");

        let full = store.get_more_roles(epoch(), true).await.unwrap();
        assert_eq!(full.len(), 1);
        assert_eq!(full[0].id, "r1");

        let delta = store.get_more_roles(epoch(), false).await.unwrap();
        assert_eq!(delta.len(), 2);
    }

    #[tokio::test]
    async fn test_delta_is_strictly_after_watermark() {
        let store = MemoryStore::new();
        let first = store.put_user(User::new("u1", "alice"));
        let second = store.put_user(User::new("u2", "bob"));
        assert!(second.modify_time > first.modify_time);

        let delta = store.get_more_users(first.modify_time, false).await.unwrap();
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].id, "u2");
    }

    #[tokio::test]
    async fn test_put_policy_normalizes_resources() {
        let store = MemoryStore::new();
        let policy = PolicyRecord::new("", "all-services", PolicyAction::Allow)
            .with_principal(Principal::user("u1"))
            .with_resource(ResourceType::Services, "svc-a")
            .with_resource(ResourceType::Services, WILDCARD);
        let stored = store.put_policy(policy);

        assert!(!stored.id.is_empty());
        assert_eq!(stored.resources.len(), 1);
        assert!(stored.resources[0].is_wildcard());
        assert_eq!(stored.resources[0].strategy_id, stored.id);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::new();
        store.inject_failures(1);
        assert!(matches!(
            store.get_more_services(epoch(), true).await,
            Err(Error::Store(_))
        ));
        assert!(store.get_more_services(epoch(), true).await.is_ok());
        assert_eq!(store.fetch_count(), 2);
    }

    #[test]
    fn test_delete_unknown_is_false() {
        let store = MemoryStore::new();
        assert!(!store.delete_policy("nope"));
        assert!(!store.delete_namespace("nope"));
    }
}
