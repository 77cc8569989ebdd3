//! Error types for the ClusterLink manager
//!
//! Provides structured error types for the CNI adapters, the node CIDR
//! controller, the network handler pipeline and the publishing controllers.

use std::time::Duration;
use thiserror::Error;

/// Fixed delay before a failed or waiting reconcile is retried
pub const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(10);

/// Unified error type for the manager
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Update conflict on {kind}/{name}")]
    Conflict { kind: String, name: String },

    // =========================================================================
    // Address Errors
    // =========================================================================
    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    #[error("Invalid IP address: {0}")]
    InvalidIp(String),

    #[error("IP family mismatch: {ip} does not belong to the family of {cidr}")]
    IpFamilyMismatch { ip: String, cidr: String },

    // =========================================================================
    // Network Pipeline Errors
    // =========================================================================
    #[error("Handler {handler} failed: {reason}")]
    Handler { handler: String, reason: String },

    #[error("Node config missing for node {node}")]
    NodeConfigMissing { node: String },

    // =========================================================================
    // CNI Adapter Errors
    // =========================================================================
    #[error("CNI adapter {adapter} not started")]
    AdapterNotStarted { adapter: String },

    #[error("CNI adapter {adapter} failed: {reason}")]
    Adapter { adapter: String, reason: String },

    #[error("Calico datastore error: {0}")]
    Datastore(String),

    #[error("Datastore connection error: {0}")]
    DatastoreConnection(#[from] reqwest::Error),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Bad static input never heals by retrying
            Error::Configuration(_) => ErrorAction::NoRequeue,

            // Everything else converges on the fixed control-loop delay
            _ => ErrorAction::RequeueAfter(DEFAULT_REQUEUE_DELAY),
        }
    }

    /// Check if this error reports a missing Kubernetes object
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Check if this error reports an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }

    pub(crate) fn handler(handler: &str, reason: impl Into<String>) -> Self {
        Error::Handler {
            handler: handler.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for the manager
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::Conflict {
            kind: "ClusterNode".into(),
            name: "member1-node1".into(),
        };
        assert_eq!(err.action(), ErrorAction::RequeueAfter(DEFAULT_REQUEUE_DELAY));

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::InvalidCidr("10.0.0.0/33".into());
        assert_eq!(err.action(), ErrorAction::RequeueAfter(Duration::from_secs(10)));
    }

    #[test]
    fn test_error_classification() {
        let not_found = Error::ResourceNotFound {
            kind: "Node".into(),
            name: "node1".into(),
        };
        assert!(not_found.is_not_found());
        assert!(!not_found.is_conflict());

        let conflict = Error::Conflict {
            kind: "ClusterNode".into(),
            name: "c1-node1".into(),
        };
        assert!(conflict.is_conflict());

        let api_conflict = Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".into(),
            message: "the object has been modified".into(),
            reason: "Conflict".into(),
            code: 409,
        }));
        assert!(api_conflict.is_conflict());
        assert!(!api_conflict.is_not_found());
    }
}
