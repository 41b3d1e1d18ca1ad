//! The generic cache contract every domain cache implements.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Stable names of the built-in caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CacheIndex {
    Namespace,
    Service,
    Users,
    Roles,
    StrategyRule,
}

impl CacheIndex {
    /// Every built-in cache, in dependency order.
    pub const ALL: [CacheIndex; 5] = [
        CacheIndex::Namespace,
        CacheIndex::Service,
        CacheIndex::Users,
        CacheIndex::Roles,
        CacheIndex::StrategyRule,
    ];

    /// Registered name of the cache.
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheIndex::Namespace => "namespace",
            CacheIndex::Service => "service",
            CacheIndex::Users => "users",
            CacheIndex::Roles => "roles",
            CacheIndex::StrategyRule => "strategyRule",
        }
    }
}

impl fmt::Display for CacheIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheIndex {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        CacheIndex::ALL
            .into_iter()
            .find(|index| index.as_str() == s)
            .ok_or_else(|| Error::CacheNotFound(s.to_string()))
    }
}

/// Opaque per-cache tunables, passed through to [`Cache::initialize`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheOptions(HashMap<String, serde_json::Value>);

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an option.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Raw option value.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(|v| v.as_bool())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(|v| v.as_u64())
    }

    /// Interpret an integer option as milliseconds.
    pub fn get_duration_ms(&self, key: &str) -> Option<Duration> {
        self.get_u64(key).map(Duration::from_millis)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One entry of the "which caches to open" list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub name: String,
    #[serde(default)]
    pub option: CacheOptions,
}

impl ConfigEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            option: CacheOptions::default(),
        }
    }

    pub fn with_option(mut self, option: CacheOptions) -> Self {
        self.option = option;
        self
    }
}

/// Uniform lifecycle of a cache.
///
/// `update` is the only mutating entry point. Implementations single-flight
/// concurrent calls and never block readers while folding.
#[async_trait::async_trait]
pub trait Cache: Send + Sync {
    /// Apply options before the first update.
    async fn initialize(&self, options: &CacheOptions) -> Result<()>;

    /// Pull the delta since the last watermark and fold it.
    async fn update(&self) -> Result<()>;

    /// Drop every cached record and reset the watermarks.
    async fn clear(&self) -> Result<()>;

    /// Registered name.
    fn name(&self) -> &str;

    /// Stop accepting updates.
    async fn close(&self) -> Result<()>;

    /// Upcast used by the typed accessors of the manager.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}
