//! Request-scoped context consulted by authorization hints.
//!
//! Interceptors build a [`RequestContext`] per call. Besides free-form
//! attributes it may carry ambient conditions; a policy that defines no
//! conditions of its own is evaluated against these instead.

use crate::condition::Condition;
use std::collections::HashMap;

/// Context passed alongside a hint request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Conditions applied to policies that define none.
    conditions: Vec<Condition>,
    /// Free-form request attributes (request id, client address, ...).
    attributes: HashMap<String, String>,
}

impl RequestContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an ambient condition.
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Replace the ambient conditions.
    pub fn with_conditions(mut self, conditions: impl IntoIterator<Item = Condition>) -> Self {
        self.conditions = conditions.into_iter().collect();
        self
    }

    /// Add a request attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Ambient conditions.
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Whether the context carries any ambient condition.
    pub fn has_conditions(&self) -> bool {
        !self.conditions.is_empty()
    }

    /// Get a request attribute.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|s| s.as_str())
    }
}
