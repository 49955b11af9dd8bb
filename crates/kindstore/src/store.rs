//! Registry of per-kind caches with a uniform read API.
//!
//! Kinds are registered with the [`WatchSource`] that feeds them. The cache
//! exists from the moment `register` returns; its population loop starts
//! once [`MultiKindStore::run`] picks the registration up, so registering
//! before `run` is fine and is the usual order.

use crate::cache::{EventType, ResourceCache};
use crate::error::Error;
use crate::kind::{Kind, ObjectKey};
use crate::list_watch::{run_list_watch, EventSink, ListWatchOptions};
use crate::scheme::Scheme;
use crate::source::WatchSource;
use crate::sync_gate::{wait_for_condition, SyncHandle};
use kube::api::DynamicObject;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct Registration {
    kind: Kind,
    cache: Arc<ResourceCache>,
    source: Arc<dyn WatchSource>,
}

/// Caches for many kinds, kept in sync with the control plane.
pub struct MultiKindStore {
    scheme: Arc<Scheme>,
    options: ListWatchOptions,
    caches: RwLock<HashMap<Kind, Arc<ResourceCache>>>,
    registrations: mpsc::UnboundedSender<Registration>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Registration>>>,
}

impl fmt::Debug for MultiKindStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiKindStore")
            .field("kinds", &self.kinds())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl MultiKindStore {
    /// Create an empty store.
    pub fn new(scheme: Arc<Scheme>, options: ListWatchOptions) -> Self {
        let (registrations, pending) = mpsc::unbounded_channel();
        Self {
            scheme,
            options,
            caches: RwLock::new(HashMap::new()),
            registrations,
            pending: Mutex::new(Some(pending)),
        }
    }

    /// Create a cache for `kind` fed by `source`.
    ///
    /// Registering the same kind twice is a configuration bug and fails with
    /// [`Error::AlreadyRegistered`]. Once `run` has returned no new kind can
    /// be populated, and registering fails with [`Error::StoreStopped`].
    pub fn register(&self, kind: Kind, source: Arc<dyn WatchSource>) -> Result<(), Error> {
        let cache = {
            let mut caches = self.caches.write();
            if caches.contains_key(&kind) {
                return Err(Error::AlreadyRegistered(kind));
            }
            let cache = Arc::new(ResourceCache::new(kind.clone(), self.scheme.copier(&kind)));
            caches.insert(kind.clone(), Arc::clone(&cache));
            cache
        };

        let described = source.describe();
        // The receiver lives as long as the store or the run loop, whichever
        // holds it; a send only fails after run has exited.
        if self.registrations.send(Registration { kind: kind.clone(), cache, source }).is_err() {
            self.caches.write().remove(&kind);
            warn!("Store has stopped; refusing to register {}", kind);
            return Err(Error::StoreStopped);
        }
        info!("Registered {} (source: {})", kind, described);
        Ok(())
    }

    fn cache(&self, kind: &Kind) -> Result<Arc<ResourceCache>, Error> {
        self.caches
            .read()
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::UnknownKind(kind.clone()))
    }

    /// Deep copy of the object at `key`, `Ok(None)` when absent.
    pub fn get(&self, kind: &Kind, key: &ObjectKey) -> Result<Option<DynamicObject>, Error> {
        Ok(self.cache(kind)?.get(key))
    }

    /// Deep-copied snapshot of every object of `kind`.
    pub fn list(&self, kind: &Kind) -> Result<Vec<DynamicObject>, Error> {
        Ok(self.cache(kind)?.list())
    }

    /// Every registered kind
    pub fn kinds(&self) -> Vec<Kind> {
        self.caches.read().keys().cloned().collect()
    }

    /// Whether the initial list for `kind` has landed
    pub fn has_synced(&self, kind: &Kind) -> Result<bool, Error> {
        Ok(self.cache(kind)?.is_synced())
    }

    /// Handle to pass to [`wait_for_sync`](crate::wait_for_sync).
    pub fn sync_handle(&self, kind: &Kind) -> Result<SyncHandle, Error> {
        let cache = self.cache(kind)?;
        Ok(SyncHandle::new(kind.to_string(), cache.subscribe_synced()))
    }

    /// Receiver notified after every change to `kind`'s cache.
    pub fn changes(&self, kind: &Kind) -> Result<watch::Receiver<u64>, Error> {
        Ok(self.cache(kind)?.subscribe_changes())
    }

    /// Wait until the object at `key` satisfies `predicate`, returning a copy
    /// of it. `Ok(None)` means `token` was cancelled first.
    pub async fn wait_for<P>(
        &self,
        token: &CancellationToken,
        kind: &Kind,
        key: &ObjectKey,
        mut predicate: P,
    ) -> Result<Option<DynamicObject>, Error>
    where
        P: FnMut(&DynamicObject) -> bool,
    {
        let cache = self.cache(kind)?;
        let changes = cache.subscribe_changes();
        Ok(wait_for_condition(token, changes, || cache.get(key).filter(|obj| predicate(obj))).await)
    }

    /// Populate every registered kind until `token` is cancelled, then wait
    /// for the population loops to finish and call `on_stopped` exactly once.
    ///
    /// Kinds registered while running are picked up as they arrive.
    pub async fn run<F>(self: Arc<Self>, token: CancellationToken, on_stopped: F) -> Result<(), Error>
    where
        F: FnOnce(),
    {
        let Some(mut pending) = self.pending.lock().take() else {
            on_stopped();
            return Err(Error::AlreadyRunning);
        };
        info!("Store running");

        let mut loops = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                () = token.cancelled() => break,
                Some(registration) = pending.recv() => {
                    self.spawn_population(&mut loops, registration, &token);
                }
                Some(joined) = loops.join_next(), if !loops.is_empty() => {
                    if let Err(e) = joined {
                        error!("Cache population task failed: {}", e);
                    }
                }
            }
        }

        pending.close();
        while let Ok(late) = pending.try_recv() {
            self.caches.write().remove(&late.kind);
            warn!("Store stopped before {} was populated; dropping it", late.kind);
        }

        info!("Store stopping, waiting for {} population loop(s)", loops.len());
        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!("Cache population task failed: {}", e);
            }
        }
        on_stopped();
        info!("Store stopped");
        Ok(())
    }

    fn spawn_population(
        &self,
        loops: &mut JoinSet<()>,
        registration: Registration,
        token: &CancellationToken,
    ) {
        let Registration { kind, cache, source } = registration;
        let options = self.options.clone();
        let token = token.clone();
        loops.spawn(async move {
            let mut sink = CacheSink { cache };
            run_list_watch(&kind, source, &mut sink, &token, &options).await;
        });
    }
}

struct CacheSink {
    cache: Arc<ResourceCache>,
}

#[async_trait::async_trait]
impl EventSink for CacheSink {
    async fn replace(&mut self, items: Vec<DynamicObject>, resource_version: Option<&str>) {
        self.cache.replace(items, resource_version);
        self.cache.mark_synced();
    }

    async fn apply(&mut self, event: EventType, obj: DynamicObject) {
        self.cache.apply_event(event, obj);
    }

    async fn resync(&mut self) {
        // Redelivering the cache's own state into itself changes nothing.
    }
}
