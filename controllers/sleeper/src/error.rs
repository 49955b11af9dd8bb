//! Controller-specific error types.

use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the Sleeper Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Store, bootstrap or watch failure
    #[error("Store error: {0}")]
    Store(#[from] kindstore::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ControllerError {
    /// Whether this is the normal result of a requested shutdown.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, ControllerError::Store(e) if e.is_cancelled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_store_cancellation_is_shutdown() {
        assert!(ControllerError::Store(kindstore::Error::Cancelled).is_shutdown());
        assert!(!ControllerError::Store(kindstore::Error::StoreStopped).is_shutdown());
        assert!(!ControllerError::InvalidConfig("bad".to_string()).is_shutdown());
    }
}
