//! Long-lived subscription to one kind that hands every change to a
//! [`ReactionHandler`].
//!
//! The watcher does not go through the store: it reacts to the raw event
//! stream. The loop that owns the connection is the one that calls the
//! handler, so delivery for a given object is in order. Dropped watches are
//! re-established (relist + rewatch) without leaving the `Running` state;
//! only cancellation stops the watcher.

use crate::cache::EventType;
use crate::error::Error;
use crate::kind::{is_newer, resource_version, Kind, ObjectKey};
use crate::list_watch::{run_list_watch, EventSink, ListWatchOptions};
use crate::source::WatchSource;
use kube::api::DynamicObject;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Reacts to changes of one kind.
///
/// Calls are made one at a time from the watch loop. Delivery is
/// at-least-once across reconnects, and an update may arrive for an object
/// whose add was never seen (e.g. after a restart), so implementations must
/// treat updates as upserts. A slow handler stalls delivery for its kind.
#[async_trait::async_trait]
pub trait ReactionHandler: Send + Sync {
    /// Object appeared
    async fn on_add(&self, obj: &DynamicObject);

    /// Object changed; `old` is the last state this watcher delivered
    async fn on_update(&self, old: &DynamicObject, new: &DynamicObject);

    /// Object disappeared
    async fn on_delete(&self, obj: &DynamicObject);

    /// Called once after the watch loop stops, before the watcher reports
    /// `Stopped`. Handlers that spawned work drain it here.
    async fn shutdown(&self) {}
}

/// Lifecycle of an [`EventWatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    /// Built, not started
    Created,
    /// Loop is running (possibly reconnecting)
    Running,
    /// Loop exited after cancellation
    Stopped,
}

/// Subscription to one kind's events.
pub struct EventWatcher {
    kind: Kind,
    source: Arc<dyn WatchSource>,
    handler: Arc<dyn ReactionHandler>,
    options: ListWatchOptions,
    state: Arc<Mutex<WatcherState>>,
    task: Option<JoinHandle<()>>,
}

impl fmt::Debug for EventWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventWatcher")
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl EventWatcher {
    /// Build a watcher in the `Created` state.
    pub fn new(
        kind: Kind,
        source: Arc<dyn WatchSource>,
        handler: Arc<dyn ReactionHandler>,
        options: ListWatchOptions,
    ) -> Self {
        Self {
            kind,
            source,
            handler,
            options,
            state: Arc::new(Mutex::new(WatcherState::Created)),
            task: None,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> WatcherState {
        *self.state.lock()
    }

    #[cfg(test)]
    pub(crate) fn state_cell(&self) -> Arc<Mutex<WatcherState>> {
        Arc::clone(&self.state)
    }

    /// Start the watch loop in the background; it runs until `token` fires.
    pub fn start(&mut self, token: &CancellationToken) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            if *state != WatcherState::Created {
                return Err(Error::AlreadyStarted(self.kind.clone()));
            }
            *state = WatcherState::Running;
        }

        let kind = self.kind.clone();
        let source = Arc::clone(&self.source);
        let handler = Arc::clone(&self.handler);
        let options = self.options.clone();
        let state = Arc::clone(&self.state);
        let token = token.clone();

        info!("Starting {} event watcher", kind);
        self.task = Some(tokio::spawn(async move {
            let mut dispatcher = Dispatcher {
                handler: Arc::clone(&handler),
                known: HashMap::new(),
            };
            run_list_watch(&kind, source, &mut dispatcher, &token, &options).await;
            handler.shutdown().await;
            *state.lock() = WatcherState::Stopped;
            info!("{} event watcher stopped", kind);
        }));
        Ok(())
    }

    /// Wait for the loop to exit. Returns immediately if never started.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("{} event watcher task failed: {}", self.kind, e);
                *self.state.lock() = WatcherState::Stopped;
            }
        }
    }
}

/// Turns list snapshots and watch events into handler calls, remembering
/// the last state delivered per object.
struct Dispatcher {
    handler: Arc<dyn ReactionHandler>,
    known: HashMap<ObjectKey, DynamicObject>,
}

impl Dispatcher {
    async fn upsert(&mut self, key: ObjectKey, obj: DynamicObject) {
        match self.known.get(&key) {
            Some(old) if !is_newer(resource_version(&obj), resource_version(old)) => {
                debug!("Skipping replay of {} at {:?}", key, resource_version(&obj));
                return;
            }
            Some(old) => self.handler.on_update(old, &obj).await,
            None => self.handler.on_add(&obj).await,
        }
        self.known.insert(key, obj);
    }
}

#[async_trait::async_trait]
impl EventSink for Dispatcher {
    async fn replace(&mut self, items: Vec<DynamicObject>, _resource_version: Option<&str>) {
        let mut listed = HashMap::with_capacity(items.len());
        for obj in items {
            if let Ok(key) = ObjectKey::from_object(&obj) {
                listed.insert(key, obj);
            }
        }

        // Objects we delivered that vanished while we were not watching
        let vanished: Vec<ObjectKey> = self
            .known
            .keys()
            .filter(|key| !listed.contains_key(*key))
            .cloned()
            .collect();
        for key in vanished {
            if let Some(last) = self.known.remove(&key) {
                self.handler.on_delete(&last).await;
            }
        }

        for (key, obj) in listed {
            self.upsert(key, obj).await;
        }
    }

    async fn apply(&mut self, event: EventType, obj: DynamicObject) {
        let Ok(key) = ObjectKey::from_object(&obj) else {
            return;
        };
        match event {
            EventType::Added | EventType::Updated => self.upsert(key, obj).await,
            EventType::Deleted => {
                self.known.remove(&key);
                self.handler.on_delete(&obj).await;
            }
        }
    }

    async fn resync(&mut self) {
        debug!("Resyncing {} objects", self.known.len());
        for obj in self.known.values() {
            self.handler.on_update(obj, obj).await;
        }
    }
}
