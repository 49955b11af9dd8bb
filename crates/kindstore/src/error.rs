//! Error types for the store, bootstrap and watch machinery.
//!
//! Two families live here: [`Error`] is what callers of the public API see,
//! [`SourceError`] is what a [`WatchSource`](crate::WatchSource) reports back
//! from the control plane.

use crate::kind::{Kind, ObjectKey};
use thiserror::Error;

/// Errors returned by the store, the bootstrapper and the supervisor.
#[derive(Debug, Error)]
pub enum Error {
    /// Read or lookup against a kind that was never registered
    #[error("unknown kind: {0}")]
    UnknownKind(Kind),

    /// The kind already has a cache in this store
    #[error("kind already registered: {0}")]
    AlreadyRegistered(Kind),

    /// `MultiKindStore::run` was called more than once
    #[error("store is already running")]
    AlreadyRunning,

    /// The watcher was started twice
    #[error("event watcher for {0} already started")]
    AlreadyStarted(Kind),

    /// The cache never caught up with the bootstrapped object before cancellation
    #[error("timed out waiting for {kind} {key} to appear in cache")]
    BootstrapTimeout {
        /// Kind of the definition object
        kind: Kind,
        /// Key of the definition object
        key: ObjectKey,
    },

    /// The control plane rejected the create/replace of the definition
    #[error("bootstrap of {key} failed: {cause}")]
    BootstrapFailed {
        /// Key of the definition object
        key: ObjectKey,
        /// Underlying control plane error
        #[source]
        cause: SourceError,
    },

    /// Watch connection dropped; the loop relists, so this only reaches logs
    #[error("watch disconnected for {kind}: {reason}")]
    WatchDisconnected {
        /// Kind being watched
        kind: Kind,
        /// What the source reported
        reason: String,
    },

    /// The governing cancellation token fired
    #[error("operation cancelled")]
    Cancelled,

    /// Object is missing metadata the store relies on
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// Typed decoding of a dynamic object failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store's run loop has exited; nothing will populate new caches
    #[error("store has stopped")]
    StoreStopped,
}

impl Error {
    /// Returns `true` when this error is the normal outcome of shutdown.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Errors reported by a [`WatchSource`](crate::WatchSource).
#[derive(Debug, Error)]
pub enum SourceError {
    /// Create hit an object that already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency check failed on replace
    #[error("conflict: {0}")]
    Conflict(String),

    /// The requested resource version is too old to watch from
    #[error("resource version gone: {0}")]
    Gone(String),

    /// The watch stream broke for a transport reason
    #[error("watch disconnected: {0}")]
    Disconnected(String),

    /// Any other rejection from the control plane
    #[error("api error: {0}")]
    Api(String),

    /// Kubernetes client error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SourceError {
    /// Whether the control plane reported the object as already present.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, SourceError::AlreadyExists(_))
    }

    /// Whether the control plane rejected a write on resource version.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, SourceError::Conflict(_))
    }
}
