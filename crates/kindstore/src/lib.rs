//! Kindstore
//!
//! Watch-fed object caches for many kinds behind one read API, plus the
//! pieces a controller needs around them: a sync gate, an idempotent
//! "make sure this definition exists" bootstrapper, an event watcher that
//! hands changes to a pluggable handler, and a supervisor that starts and
//! stops all of it in a fixed order.
//!
//! The control plane is reached through the [`WatchSource`] trait;
//! [`KubeSource`] implements it against a Kubernetes API server.

#![warn(missing_docs)]

pub mod backoff;
pub mod bootstrap;
pub mod cache;
pub mod error;
pub mod kind;
pub mod kube_source;
mod list_watch;
pub mod scheme;
pub mod source;
pub mod store;
pub mod supervisor;
pub mod sync_gate;
pub mod watcher;

#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use bootstrap::{satisfies, BootstrapOutcome, ExistenceBootstrapper, Readiness};
pub use cache::{EventType, ResourceCache};
pub use error::{Error, SourceError};
pub use kind::{compare_resource_versions, is_terminating, Kind, ObjectKey};
pub use kube_source::KubeSource;
pub use list_watch::ListWatchOptions;
pub use scheme::{DeepCopyFn, KindInfo, Scheme, Scope};
pub use source::{EventStream, ObjectList, WatchEvent, WatchSource};
pub use store::MultiKindStore;
pub use supervisor::{Bootstrap, Dependent, Supervisor};
pub use sync_gate::{wait_for_condition, wait_for_sync, SyncHandle, SyncedChecker};
pub use watcher::{EventWatcher, ReactionHandler, WatcherState};

#[cfg(any(test, feature = "test-util"))]
pub use mock::MockWatchSource;
