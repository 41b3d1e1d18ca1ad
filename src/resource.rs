//! Resource definitions for policy containment.
//!
//! Policies reference resources by `(ResourceType, id)`. The id `"*"` is the
//! match-all wildcard for its type. Per-type behaviour is resolved through a
//! static `match` table on [`ResourceType`] rather than by inspecting field
//! names at runtime.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Sentinel resource id matching every resource of a type.
pub const WILDCARD: &str = "*";

/// Kinds of resources a policy can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Namespaces,
    Services,
    ConfigGroups,
    RouteRules,
    RateLimitRules,
    CircuitBreakerRules,
    FaultDetectRules,
    LaneRules,
    Users,
    UserGroups,
    Roles,
    PolicyRules,
}

impl ResourceType {
    /// Every resource type, in declaration order.
    pub const ALL: [ResourceType; 12] = [
        ResourceType::Namespaces,
        ResourceType::Services,
        ResourceType::ConfigGroups,
        ResourceType::RouteRules,
        ResourceType::RateLimitRules,
        ResourceType::CircuitBreakerRules,
        ResourceType::FaultDetectRules,
        ResourceType::LaneRules,
        ResourceType::Users,
        ResourceType::UserGroups,
        ResourceType::Roles,
        ResourceType::PolicyRules,
    ];

    /// Wire name of the resource type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Namespaces => "namespaces",
            ResourceType::Services => "services",
            ResourceType::ConfigGroups => "config_groups",
            ResourceType::RouteRules => "route_rules",
            ResourceType::RateLimitRules => "ratelimit_rules",
            ResourceType::CircuitBreakerRules => "circuitbreaker_rules",
            ResourceType::FaultDetectRules => "faultdetect_rules",
            ResourceType::LaneRules => "lane_rules",
            ResourceType::Users => "users",
            ResourceType::UserGroups => "user_groups",
            ResourceType::Roles => "roles",
            ResourceType::PolicyRules => "auth_policies",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ResourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::InvalidConfiguration(format!("unknown resource type '{s}'")))
    }
}

/// A resource reference stored on a policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrategyResource {
    /// Policy that owns this entry.
    pub strategy_id: String,
    /// Kind of resource.
    pub res_type: ResourceType,
    /// Resource id, or [`WILDCARD`].
    pub res_id: String,
    /// Optional display name; `"*"` here also denotes the wildcard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl StrategyResource {
    /// Create a resource entry owned by `strategy_id`.
    pub fn new(
        strategy_id: impl Into<String>,
        res_type: ResourceType,
        res_id: impl Into<String>,
    ) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            res_type,
            res_id: res_id.into(),
            name: None,
        }
    }

    /// Create a wildcard entry for `res_type`.
    pub fn wildcard(strategy_id: impl Into<String>, res_type: ResourceType) -> Self {
        Self::new(strategy_id, res_type, WILDCARD)
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Whether this entry matches every resource of its type.
    pub fn is_wildcard(&self) -> bool {
        self.res_id == WILDCARD || self.name.as_deref() == Some(WILDCARD)
    }

    /// Identity used when diffing two versions of a policy.
    pub fn diff_key(&self) -> (ResourceType, &str) {
        (self.res_type, self.res_id.as_str())
    }
}

/// The resource a request wants to act on.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceEntry {
    /// Kind of resource.
    pub res_type: Option<ResourceType>,
    /// Resource id.
    pub id: String,
    /// Resource metadata, consulted by policy conditions.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ResourceEntry {
    /// Create a request-side resource.
    pub fn new(res_type: ResourceType, id: impl Into<String>) -> Self {
        Self {
            res_type: Some(res_type),
            id: id.into(),
            metadata: HashMap::new(),
        }
    }

    /// Attach one metadata label.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Get a metadata value.
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|s| s.as_str())
    }
}

/// Collapse each resource type's entry list to a single wildcard entry
/// when any entry of that type is the wildcard.
///
/// Order among surviving entries is preserved; duplicate `(type, id)` pairs
/// are dropped. The fold relies on this shape, so the store applies it
/// before a policy write is accepted.
pub fn normalize_resources(resources: &mut Vec<StrategyResource>) {
    let wildcard_types: HashSet<ResourceType> = resources
        .iter()
        .filter(|r| r.is_wildcard())
        .map(|r| r.res_type)
        .collect();

    let mut seen: HashSet<(ResourceType, String)> = HashSet::new();
    resources.retain_mut(|r| {
        if wildcard_types.contains(&r.res_type) {
            if !r.is_wildcard() {
                return false;
            }
            r.res_id = WILDCARD.to_string();
            r.name = Some(WILDCARD.to_string());
        }
        seen.insert((r.res_type, r.res_id.clone()))
    });
}
