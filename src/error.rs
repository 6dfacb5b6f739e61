//! Error types for rbac-sync
//!
//! Errors fall into two classes. Fatal errors ([`Error::is_fatal`]) mean a logic
//! or deployment defect and must stop the process. Everything else is scoped to
//! a single convergence pass: it is logged and the next trigger retries from a
//! clean read of desired and actual state.

use thiserror::Error;

/// Main error type for rbac-sync operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A configuration object could not be parsed into bindings
    #[error("parse error in {source_name}: {message}")]
    Parse {
        /// `namespace/name` of the ConfigMap that failed to parse
        source_name: String,
        /// Description of what's wrong
        message: String,
    },

    /// Identity service call failed
    #[error("identity service error: {0}")]
    Identity(String),

    /// One or more resolver workers reported failures
    #[error("identity resolution failed: {}", .0.join("; "))]
    Resolution(Vec<String>),

    /// Attempted to modify a ClusterRoleBinding that carries no management marker
    #[error("refusing to {operation} ClusterRoleBinding {binding}: not managed by rbac-sync")]
    OwnershipViolation {
        /// Name of the binding that was about to be modified
        binding: String,
        /// Operation that was refused (update, delete)
        operation: &'static str,
    },

    /// The watch cache never became ready
    #[error("cache sync failed: {0}")]
    CacheSync(String),

    /// Invalid runtime configuration
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a parse error for the given ConfigMap
    pub fn parse(source_name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Parse {
            source_name: source_name.into(),
            message: msg.into(),
        }
    }

    /// Create an identity service error with the given message
    pub fn identity(msg: impl Into<String>) -> Self {
        Self::Identity(msg.into())
    }

    /// Create a cache sync error with the given message
    pub fn cache_sync(msg: impl Into<String>) -> Self {
        Self::CacheSync(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether this error must abort the process rather than the current pass
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::OwnershipViolation { .. } | Error::CacheSync(_) | Error::Validation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: touching a binding someone else owns stops the process
    ///
    /// The ownership check is the only thing standing between this controller
    /// and a hand-written binding with the same name, so its failure is fatal.
    #[test]
    fn story_ownership_violation_is_fatal() {
        let err = Error::OwnershipViolation {
            binding: "cluster-admins".to_string(),
            operation: "delete",
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("refusing to delete"));
        assert!(err.to_string().contains("cluster-admins"));
    }

    /// Story: per-pass failures are logged and retried on the next trigger
    #[test]
    fn story_pass_scoped_errors_are_recoverable() {
        assert!(!Error::parse("default/team-a", "missing key bindings").is_fatal());
        assert!(!Error::identity("RequestLimitExceeded").is_fatal());
        assert!(!Error::Resolution(vec!["email: timeout".to_string()]).is_fatal());
        assert!(!Error::serialization("bad json").is_fatal());
    }

    #[test]
    fn test_setup_errors_are_fatal() {
        assert!(Error::cache_sync("configmaps never synced").is_fatal());
        assert!(Error::validation("requests per second must be positive").is_fatal());
    }

    #[test]
    fn test_resolution_error_lists_every_failure() {
        let err = Error::Resolution(vec![
            "email: lookup failed".to_string(),
            "subAccountId: throttled".to_string(),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("email: lookup failed"));
        assert!(msg.contains("subAccountId: throttled"));
    }

    #[test]
    fn test_parse_error_names_the_source() {
        let err = Error::parse("kube-system/admins", "bindings is not a mapping");
        assert_eq!(
            err.to_string(),
            "parse error in kube-system/admins: bindings is not a mapping"
        );
    }
}
