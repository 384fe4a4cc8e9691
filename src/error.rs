//! Error types for the Cluster Storage Controller
//!
//! Provides the structured error type shared by the transaction layer, the
//! lock facility, the layer graph and the multi-node coordinator.

use crate::security::AccessType;
use thiserror::Error;

/// Unified error type for the controller core
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A broken invariant of the controller itself. Never caught and ignored.
    #[error("Implementation error: {0}")]
    Implementation(String),

    // =========================================================================
    // Access Control Errors
    // =========================================================================
    #[error("Access denied: identity '{identity}' lacks {required} access to {object}")]
    AccessDenied {
        identity: String,
        object: String,
        required: AccessType,
    },

    // =========================================================================
    // Conflict Errors
    // =========================================================================
    #[error("Operation '{operation}' already in progress for resource {resource}")]
    OperationInProgress { operation: String, resource: String },

    #[error("No operation in flight for resource {resource}")]
    NoOperationInFlight { resource: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    #[error("Database error: {0}")]
    Database(String),

    // =========================================================================
    // Lock Errors
    // =========================================================================
    #[error("Timed out acquiring {lock} lock")]
    LockTimeout { lock: String },

    #[error("Lock {lock} is not held (write access required: {write})")]
    LockNotHeld { lock: String, write: bool },

    // =========================================================================
    // Propagation Errors
    // =========================================================================
    #[error("Satellite update failed for {resource}: {reason}")]
    Propagation { resource: String, reason: String },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Coarse classification used by callers deciding how to surface an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Capability check failed; surfaced, never retried automatically
    AccessDenied,
    /// An operation is already in flight, or the object already exists
    Conflict,
    /// Referenced object does not exist
    NotFound,
    /// Durable storage failed; the enclosing transaction was rolled back
    Database,
    /// Broken invariant; indicates a bug
    Implementation,
    /// May succeed when retried
    Transient,
    /// Malformed input or configuration
    Invalid,
}

impl Error {
    /// Classify this error
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::AccessDenied { .. } => ErrorCategory::AccessDenied,

            Error::OperationInProgress { .. } | Error::ResourceExists { .. } => {
                ErrorCategory::Conflict
            }

            Error::ResourceNotFound { .. } | Error::NoOperationInFlight { .. } => {
                ErrorCategory::NotFound
            }

            Error::Database(_) => ErrorCategory::Database,

            Error::Implementation(_)
            | Error::LockNotHeld { .. }
            | Error::Internal(_)
            | Error::Metrics(_) => ErrorCategory::Implementation,

            Error::LockTimeout { .. } | Error::Propagation { .. } | Error::Io(_) => {
                ErrorCategory::Transient
            }

            Error::Configuration(_)
            | Error::InvalidName { .. }
            | Error::InvalidRequest(_)
            | Error::Json(_)
            | Error::Yaml(_) => ErrorCategory::Invalid,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Transient)
    }

    /// Check if this error indicates a bug rather than a runtime condition
    pub fn is_fatal(&self) -> bool {
        matches!(self.category(), ErrorCategory::Implementation)
    }

    pub(crate) fn not_found(kind: &str, name: impl std::fmt::Display) -> Self {
        Error::ResourceNotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    pub(crate) fn exists(kind: &str, name: impl std::fmt::Display) -> Self {
        Error::ResourceExists {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }
}

/// Result type alias for the controller
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let err = Error::OperationInProgress {
            operation: "rollback".into(),
            resource: "rsc-1".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Conflict);

        let err = Error::AccessDenied {
            identity: "user".into(),
            object: "/rscdfns/rsc-1".into(),
            required: AccessType::Change,
        };
        assert_eq!(err.category(), ErrorCategory::AccessDenied);

        let err = Error::Database("disk full".into());
        assert_eq!(err.category(), ErrorCategory::Database);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::LockTimeout {
            lock: "NODES_MAP".into(),
        };
        assert!(transient.is_retryable());
        assert!(!transient.is_fatal());

        let bug = Error::Implementation("layer without child".into());
        assert!(!bug.is_retryable());
        assert!(bug.is_fatal());
    }

    #[test]
    fn test_lock_not_held_message() {
        let err = Error::LockNotHeld {
            lock: "RSC_DFN_MAP".into(),
            write: true,
        };
        assert_eq!(
            err.to_string(),
            "Lock RSC_DFN_MAP is not held (write access required: true)"
        );
    }
}
