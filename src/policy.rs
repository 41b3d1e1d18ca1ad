//! Authorization policy (strategy) records and their cached form.

use crate::{
    condition::{compile_all, CompiledCondition, Condition},
    error::{Error, Result},
    principal::{Principal, PrincipalType},
    record::VersionedRecord,
    resource::{normalize_resources, ResourceType, StrategyResource},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Effect of a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyAction {
    /// Grants access to the listed resources.
    Allow,
    /// Denies access to the listed resources; overrides any allow.
    Deny,
}

impl PolicyAction {
    /// Lowercase effect name as used by principal policy lookups.
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::Allow => "allow",
            PolicyAction::Deny => "deny",
        }
    }

    /// Parse an effect filter: `"allow"`, `"deny"`, or `""` for both.
    pub fn parse_effect(effect: &str) -> Result<Option<Self>> {
        match effect.trim().to_lowercase().as_str() {
            "" => Ok(None),
            "allow" => Ok(Some(PolicyAction::Allow)),
            "deny" => Ok(Some(PolicyAction::Deny)),
            other => Err(Error::InvalidConfiguration(format!("unknown effect '{other}'"))),
        }
    }
}

impl std::fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A policy as delivered by the store (a.k.a. strategy detail).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub id: String,
    pub name: String,
    pub action: PolicyAction,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub principals: Vec<Principal>,
    #[serde(default)]
    pub resources: Vec<StrategyResource>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Whether this is the built-in policy of a user or group.
    #[serde(default)]
    pub default_strategy: bool,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub revision: String,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
    pub valid: bool,
}

impl PolicyRecord {
    /// Create a valid policy with no principals or resources.
    pub fn new(id: impl Into<String>, name: impl Into<String>, action: PolicyAction) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            action,
            comment: String::new(),
            principals: Vec::new(),
            resources: Vec::new(),
            conditions: Vec::new(),
            default_strategy: false,
            owner: String::new(),
            revision: String::new(),
            create_time: now,
            modify_time: now,
            valid: true,
        }
    }

    /// Add a principal.
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principals.push(principal);
        self
    }

    /// Add a resource of `res_type`, owned by this policy.
    pub fn with_resource(mut self, res_type: ResourceType, res_id: impl Into<String>) -> Self {
        let resource = StrategyResource::new(self.id.clone(), res_type, res_id);
        self.resources.push(resource);
        self
    }

    /// Add a condition.
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Set the owner.
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Mark as the default policy of its principal.
    pub fn as_default(mut self) -> Self {
        self.default_strategy = true;
        self
    }

    /// Set the modify time.
    pub fn with_modify_time(mut self, modify_time: DateTime<Utc>) -> Self {
        self.modify_time = modify_time;
        self
    }

    /// Turn this record into a tombstone.
    pub fn tombstone(mut self) -> Self {
        self.valid = false;
        self
    }

    /// Apply the wildcard normalization rule to this policy's resources.
    pub fn normalize(&mut self) {
        normalize_resources(&mut self.resources);
    }
}

impl VersionedRecord for PolicyRecord {
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

/// A policy plus the derived lookup tables the index needs.
#[derive(Debug, Clone)]
pub struct PolicyDetailCache {
    record: PolicyRecord,
    user_principals: HashSet<String>,
    group_principals: HashSet<String>,
    role_principals: HashSet<String>,
    resource_dict: HashMap<ResourceType, HashSet<String>>,
    conditions: Vec<CompiledCondition>,
}

impl PolicyDetailCache {
    /// Build the cached form of `record`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRecord`] if the record has no id or carries a
    /// condition with an unknown comparator.
    pub fn new(record: PolicyRecord) -> Result<Self> {
        if record.id.trim().is_empty() {
            return Err(Error::invalid_record("policy", record.name.clone(), "empty policy id"));
        }
        let conditions = compile_all(&record.id, &record.conditions)?;

        let mut user_principals = HashSet::new();
        let mut group_principals = HashSet::new();
        let mut role_principals = HashSet::new();
        for principal in &record.principals {
            let id = principal.id().to_string();
            match principal.principal_type() {
                PrincipalType::User => user_principals.insert(id),
                PrincipalType::Group => group_principals.insert(id),
                PrincipalType::Role => role_principals.insert(id),
            };
        }

        let mut resource_dict: HashMap<ResourceType, HashSet<String>> = HashMap::new();
        for resource in &record.resources {
            resource_dict
                .entry(resource.res_type)
                .or_default()
                .insert(resource.res_id.clone());
        }

        Ok(Self {
            record,
            user_principals,
            group_principals,
            role_principals,
            resource_dict,
            conditions,
        })
    }

    /// The underlying record.
    pub fn record(&self) -> &PolicyRecord {
        &self.record
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn action(&self) -> PolicyAction {
        self.record.action
    }

    /// Whether `principal` is bound to this policy.
    pub fn has_principal(&self, principal: &Principal) -> bool {
        let set = match principal.principal_type() {
            PrincipalType::User => &self.user_principals,
            PrincipalType::Group => &self.group_principals,
            PrincipalType::Role => &self.role_principals,
        };
        set.contains(principal.id())
    }

    /// Whether this policy lists `res_id` (or the wildcard) for `res_type`.
    pub fn has_resource(&self, res_type: ResourceType, res_id: &str) -> bool {
        self.resource_dict
            .get(&res_type)
            .map(|ids| ids.contains(res_id) || ids.contains(crate::resource::WILDCARD))
            .unwrap_or(false)
    }

    /// Conditions with resolved comparators.
    pub fn conditions(&self) -> &[CompiledCondition] {
        &self.conditions
    }
}

impl VersionedRecord for PolicyDetailCache {
    fn id(&self) -> &str {
        &self.record.id
    }

    fn modify_time(&self) -> DateTime<Utc> {
        self.record.modify_time
    }

    fn is_valid(&self) -> bool {
        self.record.valid
    }
}
