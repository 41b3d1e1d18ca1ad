//! Principal definitions (users, groups, or roles that policies bind to).

use crate::error::Error;
use serde::{Deserialize, Serialize};

/// A principal is an entity named by policies and role memberships.
///
/// Principals are identified by the `(PrincipalType, id)` pair; the same id
/// may legitimately exist once per type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Principal {
    /// Identifier of the principal within its type.
    id: String,
    /// Kind of principal.
    principal_type: PrincipalType,
}

/// Types of principals that can be bound to policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalType {
    /// A single user account.
    User,
    /// A group of users.
    Group,
    /// A role, itself bound to users and groups.
    Role,
}

impl Principal {
    /// Create a principal of an explicit type.
    pub fn new(id: impl Into<String>, principal_type: PrincipalType) -> Self {
        Self {
            id: id.into(),
            principal_type,
        }
    }

    /// Create a user principal.
    pub fn user(id: impl Into<String>) -> Self {
        Self::new(id, PrincipalType::User)
    }

    /// Create a user-group principal.
    pub fn group(id: impl Into<String>) -> Self {
        Self::new(id, PrincipalType::Group)
    }

    /// Create a role principal.
    pub fn role(id: impl Into<String>) -> Self {
        Self::new(id, PrincipalType::Role)
    }

    /// Get the principal's identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the principal's type.
    pub fn principal_type(&self) -> PrincipalType {
        self.principal_type
    }

    /// Stable key used when principals need a flat string form.
    pub fn key(&self) -> String {
        format!("{}_{}", self.principal_type.as_str(), self.id)
    }
}

impl PrincipalType {
    /// All principal types, in declaration order.
    pub const ALL: [PrincipalType; 3] = [PrincipalType::User, PrincipalType::Group, PrincipalType::Role];

    /// Get the string representation of the principal type.
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalType::User => "user",
            PrincipalType::Group => "group",
            PrincipalType::Role => "role",
        }
    }

    /// Check if this is a user principal type.
    pub fn is_user(&self) -> bool {
        matches!(self, PrincipalType::User)
    }

    /// Check if this is a group principal type.
    pub fn is_group(&self) -> bool {
        matches!(self, PrincipalType::Group)
    }

    /// Check if this is a role principal type.
    pub fn is_role(&self) -> bool {
        matches!(self, PrincipalType::Role)
    }
}

impl std::fmt::Display for PrincipalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PrincipalType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" | "users" => Ok(PrincipalType::User),
            "group" | "groups" | "user_group" | "usergroup" => Ok(PrincipalType::Group),
            "role" | "roles" => Ok(PrincipalType::Role),
            other => Err(Error::InvalidConfiguration(format!(
                "unknown principal type '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.principal_type, self.id)
    }
}
