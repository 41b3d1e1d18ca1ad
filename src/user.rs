//! User and user-group records.

use crate::record::VersionedRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Account kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    /// The single built-in administrator.
    Admin,
    /// An owner account able to create sub-accounts.
    Owner,
    /// A sub-account created by an owner.
    #[default]
    SubAccount,
}

/// A user account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    /// Id of the owning account; empty for owners and the admin.
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub user_type: UserType,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub token_enable: bool,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
    pub valid: bool,
}

impl User {
    /// Create a valid sub-account.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            owner: String::new(),
            user_type: UserType::SubAccount,
            comment: String::new(),
            token_enable: true,
            create_time: now,
            modify_time: now,
            valid: true,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_type(mut self, user_type: UserType) -> Self {
        self.user_type = user_type;
        self
    }

    /// Turn this record into a tombstone.
    pub fn tombstone(mut self) -> Self {
        self.valid = false;
        self
    }

    /// Owner id used for name lookups; an owner account owns itself.
    pub fn effective_owner(&self) -> &str {
        if self.owner.is_empty() {
            &self.id
        } else {
            &self.owner
        }
    }
}

impl VersionedRecord for User {
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

/// A group of users.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub token_enable: bool,
    /// Member user ids.
    #[serde(default)]
    pub user_ids: HashSet<String>,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
    pub valid: bool,
}

impl UserGroup {
    /// Create a valid, empty group.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            owner: String::new(),
            comment: String::new(),
            token_enable: true,
            user_ids: HashSet::new(),
            create_time: now,
            modify_time: now,
            valid: true,
        }
    }

    /// Add a member.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_ids.insert(user_id.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Turn this record into a tombstone.
    pub fn tombstone(mut self) -> Self {
        self.valid = false;
        self
    }
}

impl VersionedRecord for UserGroup {
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
