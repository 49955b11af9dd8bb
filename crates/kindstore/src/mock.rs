//! Mock WatchSource for unit testing
//!
//! An in-memory control plane for one kind. It assigns resource versions,
//! keeps an event history so watches can resume from a version, and can be
//! told to misbehave: fail lists, drop watches, hold back events, reject
//! creates, or make concurrent creates meet at a barrier first.

use crate::error::SourceError;
use crate::kind::{Kind, ObjectKey};
use crate::source::{EventStream, ObjectList, WatchEvent, WatchSource};
use futures::channel::mpsc;
use futures::StreamExt;
use kube::api::{ApiResource, DynamicObject};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Barrier;

type Subscriber = mpsc::UnboundedSender<Result<WatchEvent, SourceError>>;

#[derive(Default)]
struct MockState {
    objects: BTreeMap<ObjectKey, DynamicObject>,
    last_rv: u64,
    history: Vec<(u64, WatchEvent)>,
    subscribers: Vec<Subscriber>,
    paused: bool,
    held: Vec<WatchEvent>,
    failing_lists: usize,
    rejected_creates: Option<String>,
    create_gate: Option<Arc<Barrier>>,
    list_calls: usize,
    watch_calls: usize,
    create_calls: usize,
    replace_calls: usize,
}

impl MockState {
    fn broadcast(&mut self, event: WatchEvent) {
        if self.paused {
            self.held.push(event);
            return;
        }
        self.subscribers
            .retain(|tx| tx.unbounded_send(Ok(event.clone())).is_ok());
    }

    fn write(&mut self, mut obj: DynamicObject) -> DynamicObject {
        self.last_rv += 1;
        obj.metadata.resource_version = Some(self.last_rv.to_string());
        let key = ObjectKey::from_object(&obj).unwrap_or_default();
        let event = if self.objects.contains_key(&key) {
            WatchEvent::Modified(obj.clone())
        } else {
            WatchEvent::Added(obj.clone())
        };
        self.objects.insert(key, obj.clone());
        self.history.push((self.last_rv, event.clone()));
        self.broadcast(event);
        obj
    }
}

/// In-memory control plane for a single kind.
pub struct MockWatchSource {
    kind: Kind,
    resource: ApiResource,
    state: Mutex<MockState>,
}

impl std::fmt::Debug for MockWatchSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockWatchSource").field("kind", &self.kind).finish_non_exhaustive()
    }
}

impl MockWatchSource {
    /// Create an empty mock for `kind`
    pub fn new(kind: Kind) -> Self {
        let resource = ApiResource::from_gvk(&kind.to_gvk());
        Self {
            kind,
            resource,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Blank object of this kind in namespace `default`
    pub fn object(&self, name: &str) -> DynamicObject {
        DynamicObject::new(name, &self.resource).within("default")
    }

    /// Blank cluster-scoped object of this kind
    pub fn cluster_object(&self, name: &str) -> DynamicObject {
        DynamicObject::new(name, &self.resource)
    }

    /// Server-side write: assigns the next resource version and notifies watchers
    pub fn insert(&self, obj: DynamicObject) -> DynamicObject {
        self.state.lock().write(obj)
    }

    /// Server-side delete; watchers see the object at a new resource version
    pub fn remove(&self, key: &ObjectKey) -> Option<DynamicObject> {
        let mut state = self.state.lock();
        let mut obj = state.objects.remove(key)?;
        state.last_rv += 1;
        obj.metadata.resource_version = Some(state.last_rv.to_string());
        let event = WatchEvent::Deleted(obj.clone());
        let rv = state.last_rv;
        state.history.push((rv, event.clone()));
        state.broadcast(event);
        Some(obj)
    }

    /// Current server-side state of `key`
    pub fn stored(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.state.lock().objects.get(key).cloned()
    }

    /// Send a raw event to open watches without touching stored state
    pub fn inject(&self, event: WatchEvent) {
        self.state.lock().broadcast(event);
    }

    /// Break every open watch with a disconnect error
    pub fn disconnect_all(&self) {
        let mut state = self.state.lock();
        for tx in state.subscribers.drain(..) {
            let _ = tx.unbounded_send(Err(SourceError::Disconnected("connection reset".to_string())));
        }
    }

    /// Hold back watch notifications until [`resume_events`](Self::resume_events)
    pub fn pause_events(&self) {
        self.state.lock().paused = true;
    }

    /// Deliver held notifications and stop holding
    pub fn resume_events(&self) {
        let mut state = self.state.lock();
        state.paused = false;
        let held = std::mem::take(&mut state.held);
        for event in held {
            state.broadcast(event);
        }
    }

    /// Make the next `n` lists fail
    pub fn fail_next_lists(&self, n: usize) {
        self.state.lock().failing_lists = n;
    }

    /// Make every create fail with an API error
    pub fn reject_creates(&self, message: &str) {
        self.state.lock().rejected_creates = Some(message.to_string());
    }

    /// Creates wait at `barrier` before committing
    pub fn set_create_barrier(&self, barrier: Arc<Barrier>) {
        self.state.lock().create_gate = Some(barrier);
    }

    /// Number of list calls so far
    pub fn list_calls(&self) -> usize {
        self.state.lock().list_calls
    }

    /// Number of watch calls so far
    pub fn watch_calls(&self) -> usize {
        self.state.lock().watch_calls
    }

    /// Number of create calls so far
    pub fn create_calls(&self) -> usize {
        self.state.lock().create_calls
    }

    /// Number of replace calls so far
    pub fn replace_calls(&self) -> usize {
        self.state.lock().replace_calls
    }
}

#[async_trait::async_trait]
impl WatchSource for MockWatchSource {
    fn describe(&self) -> String {
        format!("mock {}", self.kind)
    }

    async fn list(&self) -> Result<ObjectList, SourceError> {
        let mut state = self.state.lock();
        state.list_calls += 1;
        if state.failing_lists > 0 {
            state.failing_lists -= 1;
            return Err(SourceError::Api("list refused".to_string()));
        }
        Ok(ObjectList {
            items: state.objects.values().cloned().collect(),
            resource_version: Some(state.last_rv.to_string()),
        })
    }

    async fn watch(&self, resource_version: Option<&str>) -> Result<EventStream, SourceError> {
        let mut state = self.state.lock();
        state.watch_calls += 1;
        let (tx, rx) = mpsc::unbounded();
        if let Some(since) = resource_version.and_then(|rv| rv.parse::<u64>().ok()) {
            for (rv, event) in &state.history {
                if *rv > since {
                    let _ = tx.unbounded_send(Ok(event.clone()));
                }
            }
        }
        state.subscribers.push(tx);
        Ok(rx.boxed())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, SourceError> {
        let gate = {
            let mut state = self.state.lock();
            state.create_calls += 1;
            state.create_gate.clone()
        };
        if let Some(barrier) = gate {
            barrier.wait().await;
        }

        let mut state = self.state.lock();
        if let Some(message) = &state.rejected_creates {
            return Err(SourceError::Api(message.clone()));
        }
        let key = ObjectKey::from_object(obj).map_err(|e| SourceError::Api(e.to_string()))?;
        if state.objects.contains_key(&key) {
            return Err(SourceError::AlreadyExists(key.to_string()));
        }
        let mut fresh = obj.clone();
        fresh.metadata.resource_version = None;
        Ok(state.write(fresh))
    }

    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject, SourceError> {
        let mut state = self.state.lock();
        state.replace_calls += 1;
        let key = ObjectKey::from_object(obj).map_err(|e| SourceError::Api(e.to_string()))?;
        let Some(stored) = state.objects.get(&key) else {
            return Err(SourceError::Api(format!("{key} not found")));
        };
        if stored.metadata.resource_version != obj.metadata.resource_version {
            return Err(SourceError::Conflict(format!(
                "{key} is at {:?}, write carried {:?}",
                stored.metadata.resource_version, obj.metadata.resource_version
            )));
        }
        Ok(state.write(obj.clone()))
    }
}
