//! The control-plane primitive consumed by the store and the event watcher.
//!
//! A [`WatchSource`] serves exactly one kind: it lists the current state,
//! streams changes from a resource version onward, and accepts writes.

use crate::error::SourceError;
use futures::stream::BoxStream;
use kube::api::DynamicObject;

/// Change notification delivered by a watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// Object was created
    Added(DynamicObject),
    /// Object was changed
    Modified(DynamicObject),
    /// Object was removed; carries its last state
    Deleted(DynamicObject),
    /// Progress marker carrying only a resource version
    Bookmark(String),
}

impl WatchEvent {
    /// Resource version the event moves the stream to, if any.
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
                obj.metadata.resource_version.as_deref()
            }
            WatchEvent::Bookmark(rv) => Some(rv.as_str()),
        }
    }
}

/// Result of a full list.
#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    /// Every object of the kind at list time
    pub items: Vec<DynamicObject>,
    /// Resource version of the list itself, the point to watch from
    pub resource_version: Option<String>,
}

/// Stream of watch events; an `Err` item means the connection is unusable.
pub type EventStream = BoxStream<'static, Result<WatchEvent, SourceError>>;

/// Per-kind access to the control plane.
#[async_trait::async_trait]
pub trait WatchSource: Send + Sync {
    /// Human readable name for logs
    fn describe(&self) -> String;

    /// List every object of the kind
    async fn list(&self) -> Result<ObjectList, SourceError>;

    /// Stream changes after `resource_version`
    async fn watch(&self, resource_version: Option<&str>) -> Result<EventStream, SourceError>;

    /// Create an object; fails with [`SourceError::AlreadyExists`] when taken
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, SourceError>;

    /// Replace an object, guarded by the resource version it carries;
    /// fails with [`SourceError::Conflict`] when that version is stale
    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject, SourceError>;
}
