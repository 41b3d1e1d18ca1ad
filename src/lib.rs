//! # Registry Cache
//!
//! An in-process, incrementally synchronized mirror of service-registry and
//! authorization data, built for read-heavy workloads where every RPC runs a
//! permission check while administrative writes are comparatively rare.
//!
//! ## Features
//!
//! - Delta synchronization from a pluggable [`Store`] with per-feed watermarks
//! - Single-flight de-duplication of concurrent refreshes
//! - Policy index with principal -> allow/deny policy reverse indexes
//! - Per-principal resource containment with reference-counted entries
//! - Deny-overrides-allow authorization hints with wildcard and
//!   attribute-condition matching
//! - Role, user, user-group, namespace and service caches
//! - Lock-free reads over concurrent maps while a refresh is folding
//! - A cache manager that opens selected caches and refreshes them in the
//!   background
//!
//! ## Quick Start
//!
//! ```rust
//! use registry_cache::{
//!     CacheConfig, CacheManager, ConfigEntry, MemoryStore, PolicyAction, PolicyRecord,
//!     Principal, RequestContext, ResourceEntry, ResourceType,
//! };
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), registry_cache::Error> {
//! let store = Arc::new(MemoryStore::new());
//! store.put_policy(
//!     PolicyRecord::new("p1", "read-all-services", PolicyAction::Allow)
//!         .with_principal(Principal::user("u1"))
//!         .with_resource(ResourceType::Services, "*"),
//! );
//!
//! let manager = CacheManager::new(store, CacheConfig::default());
//! manager
//!     .open_resource_cache(&[ConfigEntry::new("strategyRule")])
//!     .await?;
//!
//! let strategy = manager.auth_strategy().expect("registered");
//! let decision = strategy.hint(
//!     &RequestContext::new(),
//!     &Principal::user("u1"),
//!     &ResourceEntry::new(ResourceType::Services, "billing"),
//! );
//! assert_eq!(decision, PolicyAction::Allow);
//!
//! manager.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Audit Logging
//!
//! The crate logs through the `log` facade. With the `audit` feature enabled,
//! [`init_audit_logger`] installs `env_logger`:
//!
//! ```rust,ignore
//! registry_cache::init_audit_logger();
//! // RUST_LOG=info,registry_cache=debug
//! ```
//!
//! The following events are logged:
//! - Cache open and close (info)
//! - Successful refreshes with record counts (debug)
//! - Store failures (warn)
//! - Records skipped because they could not be converted (warn)
//!

#[cfg(feature = "audit")]
pub fn init_audit_logger() {
    env_logger::init();
}

pub mod cache;
pub mod condition;
pub mod config;
pub mod container;
pub mod context;
pub mod error;
pub mod fold;
pub mod manager;
pub mod metrics;
pub mod namespace;
pub mod policy;
pub mod principal;
pub mod query;
pub mod record;
pub mod resource;
pub mod role;
pub mod role_cache;
pub mod service;
pub mod store;
pub mod strategy;
pub mod sync;
pub mod user;
pub mod user_cache;

#[cfg(test)]
mod property_tests;

// Re-export main types for convenience
pub use crate::{
    cache::{Cache, CacheIndex, CacheOptions, ConfigEntry},
    condition::{CompareFunc, Condition},
    config::CacheConfig,
    context::RequestContext,
    error::{Error, Result},
    manager::CacheManager,
    metrics::{CacheMetrics, MetricsSnapshot},
    namespace::{Namespace, NamespaceCache},
    policy::{PolicyAction, PolicyRecord},
    principal::{Principal, PrincipalType},
    query::{PolicyQuery, RoleQuery},
    record::{Lifecycle, VersionedRecord},
    resource::{ResourceEntry, ResourceType, StrategyResource},
    role::Role,
    role_cache::RoleCache,
    service::{Service, ServiceCache},
    store::{MemoryStore, Store},
    strategy::StrategyCache,
    sync::FoldOutcome,
    user::{User, UserGroup, UserType},
    user_cache::UserCache,
};
