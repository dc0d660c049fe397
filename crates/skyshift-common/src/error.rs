//! Error taxonomy for SkyShift
//!
//! Every component propagates the same set of error kinds so that the API
//! surface, controllers and backends agree on how a failure is handled:
//! user errors surface immediately, `Conflict` is retried after a reread,
//! `Transient` is retried with backoff, and `Fatal` bubbles to the
//! supervisor which restarts the offending component.

use thiserror::Error;

/// Convenience alias used throughout the workspace
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for SkyShift operations
#[derive(Debug, Error)]
pub enum Error {
    /// Schema or semantic validation failed
    #[error("invalid {kind}: {message}")]
    InvalidObject {
        /// Object kind being validated (e.g. "Job")
        kind: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g. "spec.replicas")
        field: Option<String>,
    },

    /// Duplicate key on create
    #[error("object '{key}' already exists")]
    AlreadyExists {
        /// Store key of the colliding object
        key: String,
    },

    /// Read/update/delete on a missing key
    #[error("object '{key}' not found")]
    NotFound {
        /// Store key that was requested
        key: String,
    },

    /// Optimistic concurrency version mismatch
    #[error("conflict on '{key}': resource version {expected} is outdated")]
    Conflict {
        /// Store key that was contested
        key: String,
        /// The resource version the caller presented
        expected: i64,
    },

    /// Authentication or authorization denied
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// Why the request was denied
        message: String,
    },

    /// A backend lacks the requested capability
    #[error("unsupported by {manager}: {operation}")]
    Unsupported {
        /// Cluster manager that cannot satisfy the operation
        manager: String,
        /// The operation that was requested
        operation: String,
    },

    /// Recoverable infrastructure failure (store unavailable, backend timeout)
    #[error("transient error [{context}]: {message}")]
    Transient {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g. "etcd", "watch", "kubernetes")
        context: String,
    },

    /// A watch consumer fell behind the replay window and must relist
    #[error("watch gap on '{prefix}': resume version {requested} is older than retained history")]
    WatchGap {
        /// Watched key prefix
        prefix: String,
        /// Resume version the consumer asked for
        requested: i64,
    },

    /// Unrecoverable failure; the supervisor restarts the component
    #[error("fatal error [{context}]: {message}")]
    Fatal {
        /// Description of what failed
        message: String,
        /// Where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a validation error without field context
    pub fn invalid(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidObject {
            kind: kind.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with the offending field path
    pub fn invalid_field(
        kind: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::InvalidObject {
            kind: kind.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create an already-exists error for the given store key
    pub fn already_exists(key: impl Into<String>) -> Self {
        Self::AlreadyExists { key: key.into() }
    }

    /// Create a not-found error for the given store key
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create a conflict error for the given key and presented version
    pub fn conflict(key: impl Into<String>, expected: i64) -> Self {
        Self::Conflict {
            key: key.into(),
            expected,
        }
    }

    /// Create an unauthorized error
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: msg.into(),
        }
    }

    /// Create an unsupported-operation error for a backend
    pub fn unsupported(manager: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Unsupported {
            manager: manager.into(),
            operation: operation.into(),
        }
    }

    /// Create a transient error with context
    pub fn transient(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Transient {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create a fatal error with context
    pub fn fatal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Fatal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check whether this error may resolve on retry.
    ///
    /// `Conflict` is retryable only after rereading the object; callers use
    /// [`Error::is_conflict`] to distinguish that path from plain backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Conflict { .. } | Error::Transient { .. } | Error::WatchGap { .. }
        )
    }

    /// Check whether this is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }

    /// Check whether this is a missing-object error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Check whether a backend reported the operation as unsupported
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Unsupported { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::invalid("Object", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_by_kind() {
        // User errors require a fixed request, not a retry
        assert!(!Error::invalid("Job", "bad replicas").is_retryable());
        assert!(!Error::already_exists("/registry/jobs/default/j1").is_retryable());
        assert!(!Error::not_found("/registry/clusters/c1").is_retryable());
        assert!(!Error::unauthorized("no role binding").is_retryable());
        assert!(!Error::unsupported("ray", "exec").is_retryable());

        // Infrastructure failures and version races may recover
        assert!(Error::conflict("/registry/jobs/default/j1", 4).is_retryable());
        assert!(Error::transient("etcd", "connection refused").is_retryable());

        // Fatal errors bubble to the supervisor instead of retrying in place
        assert!(!Error::fatal("skylet", "corrupted state").is_retryable());
    }

    #[test]
    fn test_conflict_carries_presented_version() {
        let err = Error::conflict("/registry/jobs/default/j1", 7);
        assert!(err.is_conflict());
        match err {
            Error::Conflict { expected, .. } => assert_eq!(expected, 7),
            _ => panic!("expected Conflict variant"),
        }
    }

    #[test]
    fn test_invalid_field_path_is_preserved() {
        let err = Error::invalid_field("Job", "spec.replicas", "must be positive");
        match &err {
            Error::InvalidObject { field, .. } => {
                assert_eq!(field.as_deref(), Some("spec.replicas"));
            }
            _ => panic!("expected InvalidObject variant"),
        }
        assert!(err.to_string().contains("invalid Job"));
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::transient("watch", "stream reset");
        assert!(err.to_string().contains("[watch]"));
        assert!(err.to_string().contains("stream reset"));
    }
}
