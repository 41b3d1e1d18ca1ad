//! The user cache: users, user groups and the user -> groups reverse index.
//!
//! Users and groups arrive on two separate feeds with their own watermarks.

use crate::{
    cache::{Cache, CacheIndex, CacheOptions},
    error::{Error, Result},
    fold::membership_delta,
    metrics::CacheMetrics,
    record::{max_modify_time, VersionedRecord},
    store::Store,
    sync::{FoldOutcome, SingleFlight, SyncState, UpdateResult},
    user::{User, UserGroup, UserType},
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Watermark key of the user feed.
pub const SUB_USERS: &str = "users";
/// Watermark key of the group feed.
pub const SUB_GROUPS: &str = "groups";

/// User and group cache.
pub struct UserCache {
    store: Arc<dyn Store>,
    users: DashMap<String, Arc<User>>,
    // (owner, name) -> user id
    user_names: DashMap<(String, String), String>,
    groups: DashMap<String, Arc<UserGroup>>,
    // user id -> group ids
    user_groups: DashMap<String, HashSet<String>>,
    sync: SyncState,
    flight: SingleFlight,
    metrics: CacheMetrics,
    closed: AtomicBool,
}

impl std::fmt::Debug for UserCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserCache")
            .field("users", &self.users.len())
            .field("groups", &self.groups.len())
            .finish()
    }
}

fn name_key(user: &User) -> (String, String) {
    (user.effective_owner().to_string(), user.name.clone())
}

impl UserCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            users: DashMap::new(),
            user_names: DashMap::new(),
            groups: DashMap::new(),
            user_groups: DashMap::new(),
            sync: SyncState::new(),
            flight: SingleFlight::new(),
            metrics: CacheMetrics::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Watermark of one of the two feeds.
    pub fn last_fetch_time(&self, sub: &str) -> DateTime<Utc> {
        self.sync.watermark(sub)
    }

    pub fn get_user_by_id(&self, id: &str) -> Option<User> {
        self.users.get(id).map(|u| u.as_ref().clone())
    }

    /// Look up a user by owner id and name. An owner account is found under
    /// its own id.
    pub fn get_user_by_name(&self, owner: &str, name: &str) -> Option<User> {
        let id = self
            .user_names
            .get(&(owner.to_string(), name.to_string()))
            .map(|id| id.clone())?;
        self.get_user_by_id(&id)
    }

    pub fn get_group(&self, id: &str) -> Option<UserGroup> {
        self.groups.get(id).map(|g| g.as_ref().clone())
    }

    /// Groups `user_id` belongs to.
    pub fn get_user_groups(&self, user_id: &str) -> Vec<UserGroup> {
        let mut ids: Vec<String> = self
            .user_groups
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids.iter().filter_map(|id| self.get_group(id)).collect()
    }

    pub fn is_user_in_group(&self, user_id: &str, group_id: &str) -> bool {
        self.user_groups
            .get(user_id)
            .map(|ids| ids.contains(group_id))
            .unwrap_or(false)
    }

    /// The built-in administrator, once synced.
    pub fn get_admin(&self) -> Option<User> {
        self.users
            .iter()
            .find(|u| u.user_type == UserType::Admin)
            .map(|u| u.value().as_ref().clone())
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Fold a batch of user records.
    pub fn fold_users(&self, records: &[User]) -> FoldOutcome {
        let mut outcome = FoldOutcome {
            newest: max_modify_time(records),
            ..FoldOutcome::default()
        };
        for user in records {
            if user.id.trim().is_empty() {
                let err = Error::invalid_record("user", user.name.clone(), "empty user id");
                log::warn!("[UserCache] skipping user: {}", err);
                outcome.skipped += 1;
                continue;
            }
            if let Some(old) = self.users.get(&user.id).map(|u| u.value().clone()) {
                let old_key = name_key(&old);
                self.user_names.remove_if(&old_key, |_, id| id == &old.id);
            }
            if user.is_valid() {
                self.user_names.insert(name_key(user), user.id.clone());
                self.users.insert(user.id.clone(), Arc::new(user.clone()));
            } else {
                self.users.remove(&user.id);
            }
            outcome.processed += 1;
        }
        outcome
    }

    /// Fold a batch of group records and maintain the user -> groups index.
    pub fn fold_groups(&self, records: &[UserGroup]) -> FoldOutcome {
        let mut outcome = FoldOutcome {
            newest: max_modify_time(records),
            ..FoldOutcome::default()
        };
        for group in records {
            if group.id.trim().is_empty() {
                let err = Error::invalid_record("user group", group.name.clone(), "empty group id");
                log::warn!("[UserCache] skipping group: {}", err);
                outcome.skipped += 1;
                continue;
            }
            let old = self.groups.get(&group.id).map(|g| g.value().clone());
            let delta = membership_delta(
                old.as_ref().map(|o| o.user_ids.iter()),
                group.user_ids.iter(),
                group.lifecycle(),
            );

            if group.is_valid() {
                self.groups.insert(group.id.clone(), Arc::new(group.clone()));
            }
            for user_id in &delta.unlink {
                if let Some(mut ids) = self.user_groups.get_mut(user_id) {
                    ids.remove(&group.id);
                }
            }
            for user_id in &delta.link {
                self.user_groups
                    .entry(user_id.clone())
                    .or_default()
                    .insert(group.id.clone());
            }
            if !group.is_valid() {
                self.groups.remove(&group.id);
            }
            outcome.processed += 1;
        }
        self.user_groups.retain(|_, ids| !ids.is_empty());
        outcome
    }

    async fn real_update(&self) -> Result<()> {
        let _cycle = self.sync.lock_cycle().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed(self.name().to_string()));
        }
        let started = Instant::now();
        let first = self.sync.is_first_update();
        let outcome = async {
            let users = self
                .store
                .get_more_users(self.sync.watermark(SUB_USERS), first)
                .await?;
            let groups = self
                .store
                .get_more_groups(self.sync.watermark(SUB_GROUPS), first)
                .await?;
            let mut result = UpdateResult::default();
            result.absorb(SUB_USERS, self.fold_users(&users));
            result.absorb(SUB_GROUPS, self.fold_groups(&groups));
            Ok::<_, Error>(result)
        }
        .await;
        self.sync.finish(self.name(), started, outcome, &self.metrics)
    }
}

#[async_trait::async_trait]
impl Cache for UserCache {
    async fn initialize(&self, _options: &CacheOptions) -> Result<()> {
        self.closed.store(false, Ordering::Release);
        Ok(())
    }

    async fn update(&self) -> Result<()> {
        self.flight.run(self.name(), || self.real_update()).await
    }

    async fn clear(&self) -> Result<()> {
        let _cycle = self.sync.lock_cycle().await;
        self.users.clear();
        self.user_names.clear();
        self.groups.clear();
        self.user_groups.clear();
        self.sync.reset();
        Ok(())
    }

    fn name(&self) -> &str {
        CacheIndex::Users.as_str()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
