//! Namespace records and their cache.

use crate::{
    cache::{Cache, CacheIndex, CacheOptions},
    error::{Error, Result},
    metrics::CacheMetrics,
    record::{max_modify_time, VersionedRecord},
    store::Store,
    sync::{FoldOutcome, SingleFlight, SyncState, UpdateResult},
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

const SUB_NAMESPACES: &str = "namespaces";

/// A registry namespace. Namespaces are identified by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub owner: String,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
    pub valid: bool,
}

impl Namespace {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            comment: String::new(),
            owner: String::new(),
            create_time: now,
            modify_time: now,
            valid: true,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn tombstone(mut self) -> Self {
        self.valid = false;
        self
    }
}

impl VersionedRecord for Namespace {
    fn id(&self) -> &str {
        &self.name
    }

    fn modify_time(&self) -> DateTime<Utc> {
        self.modify_time
    }

    fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Namespace cache.
pub struct NamespaceCache {
    store: Arc<dyn Store>,
    namespaces: DashMap<String, Arc<Namespace>>,
    sync: SyncState,
    flight: SingleFlight,
    metrics: CacheMetrics,
    closed: AtomicBool,
}

impl std::fmt::Debug for NamespaceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceCache")
            .field("namespaces", &self.namespaces.len())
            .finish()
    }
}

impl NamespaceCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            namespaces: DashMap::new(),
            sync: SyncState::new(),
            flight: SingleFlight::new(),
            metrics: CacheMetrics::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn get_namespace(&self, name: &str) -> Option<Namespace> {
        self.namespaces.get(name).map(|ns| ns.as_ref().clone())
    }

    /// Every live namespace, sorted by name.
    pub fn list_namespaces(&self) -> Vec<Namespace> {
        let mut namespaces: Vec<Namespace> = self
            .namespaces
            .iter()
            .map(|ns| ns.value().as_ref().clone())
            .collect();
        namespaces.sort_by(|a, b| a.name.cmp(&b.name));
        namespaces
    }

    pub fn fold_batch(&self, records: &[Namespace]) -> FoldOutcome {
        let mut outcome = FoldOutcome {
            newest: max_modify_time(records),
            ..FoldOutcome::default()
        };
        for namespace in records {
            if namespace.name.trim().is_empty() {
                log::warn!("[NamespaceCache] skipping namespace with empty name");
                outcome.skipped += 1;
                continue;
            }
            if namespace.is_valid() {
                self.namespaces
                    .insert(namespace.name.clone(), Arc::new(namespace.clone()));
            } else {
                self.namespaces.remove(&namespace.name);
            }
            outcome.processed += 1;
        }
        outcome
    }

    async fn real_update(&self) -> Result<()> {
        let _cycle = self.sync.lock_cycle().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed(self.name().to_string()));
        }
        let started = Instant::now();
        let outcome = self
            .store
            .get_more_namespaces(self.sync.watermark(SUB_NAMESPACES), self.sync.is_first_update())
            .await
            .map(|records| {
                let mut result = UpdateResult::default();
                result.absorb(SUB_NAMESPACES, self.fold_batch(&records));
                result
            });
        self.sync.finish(self.name(), started, outcome, &self.metrics)
    }
}

#[async_trait::async_trait]
impl Cache for NamespaceCache {
    async fn initialize(&self, _options: &CacheOptions) -> Result<()> {
        self.closed.store(false, Ordering::Release);
        Ok(())
    }

    async fn update(&self) -> Result<()> {
        self.flight.run(self.name(), || self.real_update()).await
    }

    async fn clear(&self) -> Result<()> {
        let _cycle = self.sync.lock_cycle().await;
        self.namespaces.clear();
        self.sync.reset();
        Ok(())
    }

    fn name(&self) -> &str {
        CacheIndex::Namespace.as_str()
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

    #[tokio::test]
    async fn test_namespace_lifecycle() {
        let store = Arc::new(MemoryStore::new());
        let cache = NamespaceCache::new(store.clone());
        store.put_namespace(Namespace::new("default"));
        store.put_namespace(Namespace::new("Polaris").with_comment("system"));
        cache.update().await.unwrap();

        let names: Vec<String> = cache.list_namespaces().into_iter().map(|ns| ns.name).collect();
        assert_eq!(names, vec!["Polaris".to_string(), "default".to_string()]);

        store.delete_namespace("default");
        cache.update().await.unwrap();
        assert!(cache.get_namespace("default").is_none());
        assert_eq!(cache.get_namespace("Polaris").map(|ns| ns.comment), Some("system".to_string()));

        cache.clear().await.unwrap();
        assert!(cache.list_namespaces().is_empty());
        cache.update().await.unwrap();
        assert_eq!(cache.list_namespaces().len(), 1);
    }
}
