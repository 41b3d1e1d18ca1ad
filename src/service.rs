//! Service records and their cache.

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
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

const SUB_SERVICES: &str = "services";

/// A registered service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub business: String,
    #[serde(default)]
    pub department: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub ports: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub revision: String,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
    pub valid: bool,
}

impl Service {
    pub fn new(id: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            namespace: namespace.into(),
            owner: String::new(),
            business: String::new(),
            department: String::new(),
            comment: String::new(),
            ports: String::new(),
            metadata: HashMap::new(),
            revision: String::new(),
            create_time: now,
            modify_time: now,
            valid: true,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn tombstone(mut self) -> Self {
        self.valid = false;
        self
    }
}

impl VersionedRecord for Service {
    fn id(&self) -> &str {
        &self.id
    }

    fn modify_time(&self) -> DateTime<Utc> {
        self.modify_time
    }

    fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Service cache indexed by id and by `(namespace, name)`.
pub struct ServiceCache {
    store: Arc<dyn Store>,
    services: DashMap<String, Arc<Service>>,
    // (namespace, name) -> id
    names: DashMap<(String, String), String>,
    // namespace -> ids
    by_namespace: DashMap<String, HashSet<String>>,
    sync: SyncState,
    flight: SingleFlight,
    metrics: CacheMetrics,
    closed: AtomicBool,
}

impl std::fmt::Debug for ServiceCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCache")
            .field("services", &self.services.len())
            .field("namespaces", &self.by_namespace.len())
            .finish()
    }
}

impl ServiceCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            services: DashMap::new(),
            names: DashMap::new(),
            by_namespace: DashMap::new(),
            sync: SyncState::new(),
            flight: SingleFlight::new(),
            metrics: CacheMetrics::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn get_service_by_id(&self, id: &str) -> Option<Service> {
        self.services.get(id).map(|s| s.as_ref().clone())
    }

    pub fn get_service_by_name(&self, namespace: &str, name: &str) -> Option<Service> {
        let id = self
            .names
            .get(&(namespace.to_string(), name.to_string()))
            .map(|id| id.clone())?;
        self.get_service_by_id(&id)
    }

    /// Services of `namespace`, sorted by name.
    pub fn list_services(&self, namespace: &str) -> Vec<Service> {
        let ids: Vec<String> = self
            .by_namespace
            .get(namespace)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        let mut services: Vec<Service> = ids
            .iter()
            .filter_map(|id| self.get_service_by_id(id))
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    pub fn service_count(&self, namespace: &str) -> usize {
        self.by_namespace
            .get(namespace)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }

    fn unlink(&self, service: &Service) {
        self.names
            .remove_if(&(service.namespace.clone(), service.name.clone()), |_, id| {
                id == &service.id
            });
        if let Some(mut ids) = self.by_namespace.get_mut(&service.namespace) {
            ids.remove(&service.id);
        }
        self.by_namespace
            .remove_if(&service.namespace, |_, ids| ids.is_empty());
    }

    pub fn fold_batch(&self, records: &[Service]) -> FoldOutcome {
        let mut outcome = FoldOutcome {
            newest: max_modify_time(records),
            ..FoldOutcome::default()
        };
        for service in records {
            if service.id.trim().is_empty() || service.namespace.trim().is_empty() {
                let err = Error::invalid_record("service", service.name.clone(), "missing id or namespace");
                log::warn!("[ServiceCache] skipping service: {}", err);
                outcome.skipped += 1;
                continue;
            }
            if let Some(old) = self.services.get(&service.id).map(|s| s.value().clone()) {
                self.unlink(&old);
            }
            if service.is_valid() {
                self.services
                    .insert(service.id.clone(), Arc::new(service.clone()));
                self.names.insert(
                    (service.namespace.clone(), service.name.clone()),
                    service.id.clone(),
                );
                self.by_namespace
                    .entry(service.namespace.clone())
                    .or_default()
                    .insert(service.id.clone());
            } else {
                self.services.remove(&service.id);
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
            .get_more_services(self.sync.watermark(SUB_SERVICES), self.sync.is_first_update())
            .await
            .map(|records| {
                let mut result = UpdateResult::default();
                result.absorb(SUB_SERVICES, self.fold_batch(&records));
                result
            });
        self.sync.finish(self.name(), started, outcome, &self.metrics)
    }
}

#[async_trait::async_trait]
impl Cache for ServiceCache {
    async fn initialize(&self, _options: &CacheOptions) -> Result<()> {
        self.closed.store(false, Ordering::Release);
        Ok(())
    }

    async fn update(&self) -> Result<()> {
        self.flight.run(self.name(), || self.real_update()).await
    }

    async fn clear(&self) -> Result<()> {
        let _cycle = self.sync.lock_cycle().await;
        self.services.clear();
        self.names.clear();
        self.by_namespace.clear();
        self.sync.reset();
        Ok(())
    }

    fn name(&self) -> &str {
        CacheIndex::Service.as_str()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
