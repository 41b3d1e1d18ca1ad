//! The cache manager: registry of named caches and their refresh loops.
//!
//! A manager is built once at process start and handed to whoever needs
//! cache access. Built-in caches are registered by [`CacheManager::new`];
//! extra ones may be added with [`CacheManager::register_cacher`] before
//! the manager is shared. Opening a cache runs its first update
//! synchronously and then refreshes it on a tokio interval until
//! [`CacheManager::close`].

use crate::{
    cache::{Cache, CacheIndex, ConfigEntry},
    config::CacheConfig,
    error::{Error, Result},
    namespace::NamespaceCache,
    role_cache::RoleCache,
    service::ServiceCache,
    store::Store,
    strategy::StrategyCache,
    user_cache::UserCache,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Registry of caches plus their background refresh tasks.
pub struct CacheManager {
    config: CacheConfig,
    caches: HashMap<String, Arc<dyn Cache>>,
    // registration order; open and update_all walk caches in this order
    order: Vec<String>,
    opened: Mutex<Vec<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("caches", &self.order)
            .field("opened", &self.opened_caches())
            .finish()
    }
}

impl CacheManager {
    /// Build a manager with every built-in cache registered against `store`.
    pub fn new(store: Arc<dyn Store>, config: CacheConfig) -> Self {
        let mut manager = Self::empty(config);
        manager.register_cacher(
            CacheIndex::Namespace.as_str(),
            Arc::new(NamespaceCache::new(store.clone())),
        );
        manager.register_cacher(
            CacheIndex::Service.as_str(),
            Arc::new(ServiceCache::new(store.clone())),
        );
        manager.register_cacher(
            CacheIndex::Users.as_str(),
            Arc::new(UserCache::new(store.clone())),
        );
        manager.register_cacher(
            CacheIndex::Roles.as_str(),
            Arc::new(RoleCache::new(store.clone())),
        );
        manager.register_cacher(
            CacheIndex::StrategyRule.as_str(),
            Arc::new(StrategyCache::new(store)),
        );
        manager
    }

    /// Build a manager with no cache registered.
    pub fn empty(config: CacheConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            caches: HashMap::new(),
            order: Vec::new(),
            opened: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Register `cache` under `name`, replacing any previous registration.
    pub fn register_cacher(&mut self, name: impl Into<String>, cache: Arc<dyn Cache>) {
        let name = name.into();
        if self.caches.insert(name.clone(), cache).is_none() {
            self.order.push(name);
        } else {
            log::warn!("[CacheManager] cache '{}' registered twice; keeping the latest", name);
        }
    }

    /// Cache registered under `name`.
    pub fn get_cacher(&self, name: &str) -> Option<Arc<dyn Cache>> {
        self.caches.get(name).cloned()
    }

    /// Names of every registered cache, in registration order.
    pub fn cache_names(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Names of the caches opened so far.
    pub fn opened_caches(&self) -> Vec<String> {
        lock(&self.opened).clone()
    }

    /// Open the caches listed in the configuration, if it enables caching.
    pub async fn open(&self) -> Result<()> {
        if !self.config.open {
            log::info!("[CacheManager] caching disabled by configuration");
            return Ok(());
        }
        self.config.validate()?;
        let entries = self.config.resources.clone();
        self.open_resource_cache(&entries).await
    }

    /// Initialize, synchronously update and start refreshing each of
    /// `entries`. Caches not listed stay dormant.
    ///
    /// # Errors
    ///
    /// Fails on the first unknown cache name or failing first update; caches
    /// opened before the failure keep running.
    pub async fn open_resource_cache(&self, entries: &[ConfigEntry]) -> Result<()> {
        self.shutdown.send_if_modified(|stopped| std::mem::replace(stopped, false));

        for entry in entries {
            let cache = self
                .get_cacher(&entry.name)
                .ok_or_else(|| Error::CacheNotFound(entry.name.clone()))?;
            if lock(&self.opened).contains(&entry.name) {
                log::debug!("[CacheManager] cache '{}' already open", entry.name);
                continue;
            }
            let period = self.config.interval_for(entry)?;

            cache.initialize(&entry.option).await?;
            cache.update().await?;

            let handle = spawn_refresh(cache, period, self.shutdown.subscribe());
            lock(&self.tasks).push(handle);
            lock(&self.opened).push(entry.name.clone());
            log::info!(
                "[CacheManager] opened cache '{}' (refresh every {:?})",
                entry.name,
                period
            );
        }
        Ok(())
    }

    /// Update every opened cache once, in registration order.
    ///
    /// All caches are attempted; the first error is returned.
    pub async fn update_all(&self) -> Result<()> {
        let opened = self.opened_caches();
        let mut first_error = None;
        for name in self.order.iter().filter(|name| opened.contains(name)) {
            if let Some(cache) = self.get_cacher(name) {
                if let Err(err) = cache.update().await {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Stop every refresh task and close every opened cache.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.send_replace(true);
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            if let Err(err) = task.await {
                log::warn!("[CacheManager] refresh task ended abnormally: {}", err);
            }
        }

        let opened = std::mem::take(&mut *lock(&self.opened));
        for name in &opened {
            if let Some(cache) = self.get_cacher(name) {
                cache.close().await?;
            }
        }
        log::info!("[CacheManager] closed {} caches", opened.len());
        Ok(())
    }

    fn typed<T: Send + Sync + 'static>(&self, index: CacheIndex) -> Option<Arc<T>> {
        self.get_cacher(index.as_str())?.as_any().downcast::<T>().ok()
    }

    pub fn namespace(&self) -> Option<Arc<NamespaceCache>> {
        self.typed(CacheIndex::Namespace)
    }

    pub fn service(&self) -> Option<Arc<ServiceCache>> {
        self.typed(CacheIndex::Service)
    }

    pub fn user(&self) -> Option<Arc<UserCache>> {
        self.typed(CacheIndex::Users)
    }

    pub fn role(&self) -> Option<Arc<RoleCache>> {
        self.typed(CacheIndex::Roles)
    }

    pub fn auth_strategy(&self) -> Option<Arc<StrategyCache>> {
        self.typed(CacheIndex::StrategyRule)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn spawn_refresh(
    cache: Arc<dyn Cache>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick fires immediately and the cache was just updated
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = cache.update().await {
                        log::debug!("[CacheManager] background refresh of '{}' failed: {}", cache.name(), err);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::debug!("[CacheManager] refresh loop of '{}' stopped", cache.name());
    })
}
