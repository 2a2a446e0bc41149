//! Error types for the Stratus control plane
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the contextual information (cluster, space,
//! resource names) needed to act on the failure.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Stratus operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for CRD specs
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the resource with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.type")
        field: Option<String>,
    },

    /// A worker cluster could not be reached or its clients could not be built
    #[error("cluster {cluster} unavailable: {message}")]
    ClusterUnavailable {
        /// Name of the worker cluster
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// A namespace exists but is not labeled as platform-owned.
    /// Never self-healed; requires operator intervention.
    #[error("namespace {namespace} in cluster {cluster} is not managed by stratus")]
    OwnershipViolation {
        /// The offending namespace
        namespace: String,
        /// Cluster where the namespace lives ("master" or a worker name)
        cluster: String,
    },

    /// Helm release operation failure
    #[error("helm error for release {release}: {message}")]
    Helm {
        /// Helm release name
        release: String,
        /// Description of what failed
        message: String,
        /// Permanent failures (unknown chart, bad repository URL) are
        /// never retried; the resource parks in its Failed phase instead
        terminal: bool,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "reconciler", "store")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with resource context and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a cluster-unavailable error
    pub fn cluster_unavailable(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ClusterUnavailable {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create an ownership-violation error
    pub fn ownership_violation(namespace: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self::OwnershipViolation {
            namespace: namespace.into(),
            cluster: cluster.into(),
        }
    }

    /// Create a transient helm error for a release
    pub fn helm(release: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Helm {
            release: release.into(),
            message: msg.into(),
            terminal: false,
        }
    }

    /// Create a helm error that will not succeed on retry
    pub fn helm_terminal(release: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Helm {
            release: release.into(),
            message: msg.into(),
            terminal: true,
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with the resource kind
    pub fn serialization_of(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error without specific context
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(msg: impl Into<String>, context: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether the error is worth retrying.
    ///
    /// Kubernetes errors are retryable unless the server rejected the
    /// request outright (4xx other than conflict/too-many-requests).
    /// Cluster-unavailable failures are transient by nature; helm
    /// failures carry their own terminal flag; validation and ownership
    /// violations require human intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(e) => {
                    e.code == 409 || e.code == 429 || !(400..500).contains(&e.code)
                }
                _ => true,
            },
            Error::ClusterUnavailable { .. } => true,
            Error::Helm { terminal, .. } => !terminal,
            Error::Internal { .. } => true,
            Error::Validation { .. } => false,
            Error::OwnershipViolation { .. } => false,
            Error::Serialization { .. } => false,
        }
    }

    /// Whether the error is an optimistic-concurrency conflict (HTTP 409)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(e) } if e.code == 409)
    }

    /// Whether the error is a not-found response (HTTP 404)
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(e) } if e.code == 404)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> Error {
        Error::Kube {
            source: kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "test".to_string(),
                reason: "test".to_string(),
                code,
            }),
        }
    }

    #[test]
    fn conflict_is_retryable() {
        let err = api_error(409);
        assert!(err.is_retryable());
        assert!(err.is_conflict());
    }

    #[test]
    fn not_found_is_not_retryable() {
        let err = api_error(404);
        assert!(!err.is_retryable());
        assert!(err.is_not_found());
        assert!(!err.is_conflict());
    }

    #[test]
    fn server_errors_are_retryable() {
        assert!(api_error(500).is_retryable());
        assert!(api_error(503).is_retryable());
        assert!(api_error(429).is_retryable());
    }

    #[test]
    fn validation_and_ownership_are_terminal() {
        assert!(!Error::validation("bad spec").is_retryable());
        assert!(!Error::ownership_violation("ns", "worker-1").is_retryable());
    }

    #[test]
    fn helm_retryability_follows_terminal_flag() {
        assert!(Error::helm("velero", "connection reset by peer").is_retryable());
        assert!(!Error::helm_terminal("velero", "chart \"velero\" version \"9.9.9\" not found")
            .is_retryable());
    }

    #[test]
    fn cluster_unavailable_is_retryable() {
        let err = Error::cluster_unavailable("worker-1", "connection refused");
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "cluster worker-1 unavailable: connection refused"
        );
    }

    #[test]
    fn ownership_violation_names_both_sides() {
        let err = Error::ownership_violation("team-a", "worker-1");
        assert_eq!(
            err.to_string(),
            "namespace team-a in cluster worker-1 is not managed by stratus"
        );
    }

    #[test]
    fn constructor_helpers_fill_context() {
        match Error::validation_for_field("app-1", "spec.type", "unknown workload type") {
            Error::Validation {
                resource,
                field,
                message,
            } => {
                assert_eq!(resource, "app-1");
                assert_eq!(field.as_deref(), Some("spec.type"));
                assert_eq!(message, "unknown workload type");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
