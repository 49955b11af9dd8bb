//! Per-kind local mirror of remotely owned objects.
//!
//! A [`ResourceCache`] is fed by exactly one list-watch loop and answers
//! point lookups. Events are collapsed per key by resource version, so
//! replays, duplicates and reordering never move an entry backwards.

use crate::kind::{is_newer, resource_version, Kind, ObjectKey};
use crate::scheme::DeepCopyFn;
use kube::api::DynamicObject;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::watch;
use tracing::{debug, warn};

/// What happened to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Object appeared
    Added,
    /// Object changed (also used for resync redelivery)
    Updated,
    /// Object disappeared
    Deleted,
}

#[derive(Default)]
struct Entries {
    objects: HashMap<ObjectKey, DynamicObject>,
    // Version at which a key was deleted; blocks late Added/Updated replays.
    tombstones: HashMap<ObjectKey, Option<String>>,
}

/// Local mirror of one kind.
pub struct ResourceCache {
    kind: Kind,
    copier: DeepCopyFn,
    entries: RwLock<Entries>,
    synced: watch::Sender<bool>,
    changes: watch::Sender<u64>,
}

impl fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCache")
            .field("kind", &self.kind)
            .field("len", &self.len())
            .field("synced", &self.is_synced())
            .finish_non_exhaustive()
    }
}

impl ResourceCache {
    /// Create an empty, unsynced cache
    pub fn new(kind: Kind, copier: DeepCopyFn) -> Self {
        let (synced, _) = watch::channel(false);
        let (changes, _) = watch::channel(0);
        Self {
            kind,
            copier,
            entries: RwLock::new(Entries::default()),
            synced,
            changes,
        }
    }

    /// Kind mirrored by this cache
    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// Apply one change. Returns `true` when the visible state changed.
    ///
    /// Stale events (older resource version than what is stored, or than the
    /// version the key was deleted at) and exact replays are ignored.
    pub fn apply_event(&self, event: EventType, obj: DynamicObject) -> bool {
        let key = match ObjectKey::from_object(&obj) {
            Ok(key) => key,
            Err(e) => {
                warn!("Dropping {:?} event for {}: {}", event, self.kind, e);
                return false;
            }
        };

        let changed = {
            let mut entries = self.entries.write();
            match event {
                EventType::Added | EventType::Updated => Self::upsert(&mut entries, key.clone(), obj),
                EventType::Deleted => Self::remove(&mut entries, &key, &obj),
            }
        };

        if changed {
            debug!("{} {} {:?}", self.kind, key, event);
            self.bump();
        } else {
            debug!("{} {} {:?} ignored (stale or duplicate)", self.kind, key, event);
        }
        changed
    }

    fn upsert(entries: &mut Entries, key: ObjectKey, obj: DynamicObject) -> bool {
        let incoming = resource_version(&obj);
        if let Some(stored) = entries.objects.get(&key) {
            if !is_newer(incoming, resource_version(stored)) {
                return false;
            }
        } else if let Some(deleted_at) = entries.tombstones.get(&key) {
            if !is_newer(incoming, deleted_at.as_deref()) {
                return false;
            }
        }
        entries.tombstones.remove(&key);
        entries.objects.insert(key, obj);
        true
    }

    fn remove(entries: &mut Entries, key: &ObjectKey, obj: &DynamicObject) -> bool {
        let incoming = resource_version(obj);
        match entries.objects.get(key) {
            Some(stored) => {
                if incoming.is_some() && is_newer(resource_version(stored), incoming) {
                    return false;
                }
                let deleted_at = incoming.or(resource_version(stored)).map(str::to_string);
                entries.objects.remove(key);
                entries.tombstones.insert(key.clone(), deleted_at);
                true
            }
            None => {
                let newer_tombstone = match entries.tombstones.get(key) {
                    Some(existing) => incoming.is_some() && is_newer(incoming, existing.as_deref()),
                    None => true,
                };
                if newer_tombstone {
                    entries.tombstones.insert(key.clone(), incoming.map(str::to_string));
                }
                false
            }
        }
    }

    /// Replace the whole content with a fresh list.
    ///
    /// Listed objects follow the usual staleness rule. Cached keys absent
    /// from the list are dropped unless they are newer than the list itself.
    pub fn replace(&self, items: Vec<DynamicObject>, list_version: Option<&str>) {
        {
            let mut entries = self.entries.write();
            let mut previous = std::mem::take(&mut entries.objects);
            entries.tombstones.clear();

            for obj in items {
                let key = match ObjectKey::from_object(&obj) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!("Dropping listed {} object: {}", self.kind, e);
                        continue;
                    }
                };
                let keep = match previous.remove(&key) {
                    Some(stored) if !is_newer(resource_version(&obj), resource_version(&stored)) => stored,
                    _ => obj,
                };
                entries.objects.insert(key, keep);
            }

            for (key, stored) in previous {
                let created_after_list = list_version.is_some()
                    && resource_version(&stored).is_some()
                    && is_newer(resource_version(&stored), list_version);
                if created_after_list {
                    entries.objects.insert(key, stored);
                }
            }
        }
        debug!("{} replaced with {} objects", self.kind, self.len());
        self.bump();
    }

    /// Deep copy of the object at `key`.
    pub fn get(&self, key: &ObjectKey) -> Option<DynamicObject> {
        self.entries.read().objects.get(key).map(|obj| (self.copier)(obj))
    }

    /// Deep-copied snapshot of every object, in no particular order.
    pub fn list(&self) -> Vec<DynamicObject> {
        self.entries
            .read()
            .objects
            .values()
            .map(|obj| (self.copier)(obj))
            .collect()
    }

    /// Number of cached objects
    pub fn len(&self) -> usize {
        self.entries.read().objects.len()
    }

    /// Whether the cache holds no objects
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flip the synced flag once the initial list has landed.
    pub fn mark_synced(&self) {
        if !self.synced.send_replace(true) {
            debug!("{} cache synced", self.kind);
        }
    }

    /// Whether the initial list has landed
    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Receiver that observes the synced flag
    pub fn subscribe_synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    /// Receiver notified after every effective mutation
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    fn bump(&self) {
        self.changes.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}
