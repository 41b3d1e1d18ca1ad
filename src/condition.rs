//! Attribute conditions evaluated against resource metadata.

use crate::error::{Error, Result};
use crate::resource::ResourceEntry;
use serde::{Deserialize, Serialize};

/// Prefix accepted in front of any comparator name; semantically a no-op.
pub const FOR_ANY_VALUE_PREFIX: &str = "for_any_value:";

/// A single `key <compare_func> value` condition as stored on a policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Condition {
    /// Resource metadata key to read.
    pub key: String,
    /// Expected value.
    pub value: String,
    /// Comparator name, e.g. `string_equal`.
    pub compare_func: String,
}

impl Condition {
    /// Create a condition.
    pub fn new(
        key: impl Into<String>,
        compare_func: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            compare_func: compare_func.into(),
        }
    }

    /// Shorthand for a `string_equal` condition.
    pub fn string_equal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(key, CompareFunc::StringEqual.as_str(), value)
    }
}

/// Supported comparators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareFunc {
    StringEqual,
    StringNotEqual,
    StringEqualIgnoreCase,
    StringNotEqualIgnoreCase,
}

impl CompareFunc {
    /// Canonical comparator name.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompareFunc::StringEqual => "string_equal",
            CompareFunc::StringNotEqual => "string_not_equal",
            CompareFunc::StringEqualIgnoreCase => "string_equal_ignore_case",
            CompareFunc::StringNotEqualIgnoreCase => "string_not_equal_ignore_case",
        }
    }

    /// Parse a comparator name, accepting the `for_any_value:` prefix.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        let name = name.strip_prefix(FOR_ANY_VALUE_PREFIX).unwrap_or(name);
        match name {
            "string_equal" => Some(CompareFunc::StringEqual),
            "string_not_equal" => Some(CompareFunc::StringNotEqual),
            "string_equal_ignore_case" => Some(CompareFunc::StringEqualIgnoreCase),
            "string_not_equal_ignore_case" => Some(CompareFunc::StringNotEqualIgnoreCase),
            _ => None,
        }
    }

    /// Compare the expected value against the actual metadata value.
    pub fn compare(&self, expected: &str, actual: &str) -> bool {
        match self {
            CompareFunc::StringEqual => expected == actual,
            CompareFunc::StringNotEqual => expected != actual,
            CompareFunc::StringEqualIgnoreCase => expected.eq_ignore_ascii_case(actual),
            CompareFunc::StringNotEqualIgnoreCase => !expected.eq_ignore_ascii_case(actual),
        }
    }
}

/// A condition whose comparator has been resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledCondition {
    key: String,
    value: String,
    func: CompareFunc,
}

impl CompiledCondition {
    /// Resolve the comparator of `condition`.
    pub fn compile(condition: &Condition) -> Option<Self> {
        CompareFunc::parse(&condition.compare_func).map(|func| Self {
            key: condition.key.clone(),
            value: condition.value.clone(),
            func,
        })
    }

    /// Check this condition against a resource's metadata. A missing key never matches.
    pub fn matches(&self, resource: &ResourceEntry) -> bool {
        match resource.metadata(&self.key) {
            Some(actual) => self.func.compare(&self.value, actual),
            None => false,
        }
    }
}

/// Compile every condition of policy `policy_id`, failing on the first unknown comparator.
pub fn compile_all(policy_id: &str, conditions: &[Condition]) -> Result<Vec<CompiledCondition>> {
    conditions
        .iter()
        .map(|c| {
            CompiledCondition::compile(c).ok_or_else(|| {
                Error::invalid_record(
                    "policy",
                    policy_id,
                    format!("unknown comparator '{}' on key '{}'", c.compare_func, c.key),
                )
            })
        })
        .collect()
}

/// Logical AND over `conditions`. An empty list never matches.
pub fn match_all(conditions: &[CompiledCondition], resource: &ResourceEntry) -> bool {
    !conditions.is_empty() && conditions.iter().all(|c| c.matches(resource))
}
