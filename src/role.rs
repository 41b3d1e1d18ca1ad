//! Role records.

use crate::{principal::Principal, record::VersionedRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A role groups users and user groups so that policies can name them at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    /// Unique identifier for the role.
    pub id: String,
    /// Human-readable name of the role.
    pub name: String,
    #[serde(default)]
    pub owner: String,
    /// Where the role was defined (e.g. "local", an external IdP name).
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub default_role: bool,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Member users.
    #[serde(default)]
    pub users: Vec<Principal>,
    /// Member user groups.
    #[serde(default)]
    pub user_groups: Vec<Principal>,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
    pub valid: bool,
}

impl Role {
    /// Create a valid role with no members.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            owner: String::new(),
            source: String::new(),
            default_role: false,
            comment: String::new(),
            metadata: HashMap::new(),
            users: Vec::new(),
            user_groups: Vec::new(),
            create_time: now,
            modify_time: now,
            valid: true,
        }
    }

    /// Add a member user.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.users.push(Principal::user(user_id));
        self
    }

    /// Add a member user group.
    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.user_groups.push(Principal::group(group_id));
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Set metadata for this role.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Turn this record into a tombstone.
    pub fn tombstone(mut self) -> Self {
        self.valid = false;
        self
    }

    /// All members, users first.
    pub fn members(&self) -> impl Iterator<Item = &Principal> {
        self.users.iter().chain(self.user_groups.iter())
    }

    /// Whether `principal` is a direct member.
    pub fn has_member(&self, principal: &Principal) -> bool {
        self.members().any(|m| m == principal)
    }
}

impl VersionedRecord for Role {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_members() {
        let role = Role::new("r1", "operators")
            .with_user("u1")
            .with_user("u2")
            .with_group("g1")
            .with_metadata("team", "sre");

        assert_eq!(role.members().count(), 3);
        assert!(role.has_member(&Principal::user("u2")));
        assert!(role.has_member(&Principal::group("g1")));
        assert!(!role.has_member(&Principal::group("u1")));
        assert_eq!(role.metadata.get("team").map(String::as_str), Some("sre"));
    }

    #[test]
    fn test_role_tombstone() {
        let role = Role::new("r1", "operators").tombstone();
        assert!(!role.is_valid());
    }
}
