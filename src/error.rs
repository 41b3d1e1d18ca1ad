//! Error types for the registry cache.

use thiserror::Error;

/// The main error type for cache operations.
///
/// The type is `Clone` so that a single refresh outcome can be handed to
/// every caller that joined the same in-flight update.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The backing store failed to deliver a delta.
    #[error("Store operation failed: {0}")]
    Store(String),

    /// A single record could not be converted into its cached form.
    #[error("Invalid {kind} record '{id}': {reason}")]
    InvalidRecord {
        /// Record kind (e.g. "policy", "role").
        kind: &'static str,
        /// Identifier of the offending record.
        id: String,
        /// Why the record was rejected.
        reason: String,
    },

    /// No cache is registered under the given name.
    #[error("Cache '{0}' not found")]
    CacheNotFound(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The task driving an in-flight update went away before publishing a result.
    #[error("Update of cache '{0}' was aborted")]
    UpdateAborted(String),

    /// The cache has been closed and no longer accepts updates.
    #[error("Cache '{0}' is closed")]
    Closed(String),
}

impl Error {
    /// Shorthand for building an [`Error::InvalidRecord`].
    pub fn invalid_record(
        kind: &'static str,
        id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::InvalidRecord {
            kind,
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// Short label used when counting failures.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Store(_) => "store",
            Error::InvalidRecord { .. } => "invalid_record",
            Error::CacheNotFound(_) => "cache_not_found",
            Error::InvalidConfiguration(_) => "invalid_configuration",
            Error::UpdateAborted(_) => "update_aborted",
            Error::Closed(_) => "closed",
        }
    }

    /// Whether the next refresh cycle may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Store(_) | Error::UpdateAborted(_))
    }
}

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_record_display() {
        let err = Error::invalid_record("policy", "p-1", "unknown comparator 'regex'");
        assert_eq!(
            err.to_string(),
            "Invalid policy record 'p-1': unknown comparator 'regex'"
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_store_errors_are_retryable() {
        assert!(Error::Store("connection reset".to_string()).is_retryable());
        assert!(Error::UpdateAborted("roles".to_string()).is_retryable());
        assert!(!Error::Closed("roles".to_string()).is_retryable());
    }
}
