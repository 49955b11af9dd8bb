//! Idempotent "ensure this definition exists" protocol.
//!
//! The bootstrapper only returns success once the definition is visible in
//! the local cache, so anything reading the cache right afterwards sees it.
//! The definition's kind must be registered in the store and synced before
//! [`ExistenceBootstrapper::ensure`] is called; against an unsynced cache the
//! "already there" check is meaningless.

use crate::error::Error;
use crate::kind::{is_newer, is_terminating, resource_version, Kind, ObjectKey};
use crate::source::WatchSource;
use crate::store::MultiKindStore;
use crate::sync_gate::wait_for_condition;
use kube::api::DynamicObject;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Extra condition the cached definition must meet before `ensure` returns.
pub type Readiness = Arc<dyn Fn(&DynamicObject) -> bool + Send + Sync>;

/// How `ensure` reached success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// Cache already held a satisfying definition; no write was issued
    AlreadyPresent,
    /// This call created the definition
    Created,
    /// Someone else created it first; this call waited for it to show up
    CreatedConcurrently,
    /// The definition existed but drifted and was replaced
    Updated,
}

/// Ensures one definition object exists and is visible in the store.
pub struct ExistenceBootstrapper {
    store: Arc<MultiKindStore>,
    kind: Kind,
    source: Arc<dyn WatchSource>,
    readiness: Option<Readiness>,
}

impl fmt::Debug for ExistenceBootstrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExistenceBootstrapper")
            .field("kind", &self.kind)
            .field("readiness", &self.readiness.is_some())
            .finish_non_exhaustive()
    }
}

impl ExistenceBootstrapper {
    /// Bootstrapper writing through `source` and reading from `store`.
    pub fn new(store: Arc<MultiKindStore>, kind: Kind, source: Arc<dyn WatchSource>) -> Self {
        Self {
            store,
            kind,
            source,
            readiness: None,
        }
    }

    /// Also wait until the cached definition passes `readiness`.
    #[must_use]
    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = Some(readiness);
        self
    }

    /// Make sure `desired` exists and is visible in the cache.
    ///
    /// A cached copy that is being deleted never counts as present; `ensure`
    /// waits for it to disappear and then creates a fresh one.
    ///
    /// # Errors
    ///
    /// * [`Error::BootstrapFailed`] when the control plane rejects the write
    ///   for any reason other than "already exists"
    /// * [`Error::BootstrapTimeout`] when `token` fires before the cache
    ///   shows the definition
    /// * [`Error::Cancelled`] when `token` fires during a write
    pub async fn ensure(
        &self,
        token: &CancellationToken,
        desired: &DynamicObject,
    ) -> Result<BootstrapOutcome, Error> {
        let key = ObjectKey::from_object(desired)?;
        if !self.store.has_synced(&self.kind)? {
            warn!("Ensuring {} {} against a cache that has not synced", self.kind, key);
        }

        let (outcome, written_at) = loop {
            match self.store.get(&self.kind, &key)? {
                Some(observed) if is_terminating(&observed) => {
                    info!("{} {} is being deleted, waiting for it to go", self.kind, key);
                    self.await_gone(token, &key).await?;
                }
                Some(observed) if satisfies(&observed, desired) => {
                    debug!("{} {} already present", self.kind, key);
                    break (BootstrapOutcome::AlreadyPresent, None);
                }
                Some(observed) => {
                    info!("Updating {} {}", self.kind, key);
                    let replacement = merge_desired(&observed, desired);
                    let replaced = tokio::select! {
                        biased;
                        () = token.cancelled() => return Err(Error::Cancelled),
                        res = self.source.replace(&replacement) => res,
                    };
                    match replaced {
                        Ok(written) => {
                            break (BootstrapOutcome::Updated, written.metadata.resource_version);
                        }
                        Err(e) if e.is_conflict() => {
                            debug!("Conflict updating {} {}, waiting for a fresher copy: {}", self.kind, key, e);
                            self.await_newer_than(token, &key, resource_version(&observed)).await?;
                        }
                        Err(cause) => return Err(Error::BootstrapFailed { key, cause }),
                    }
                }
                None => {
                    let created = tokio::select! {
                        biased;
                        () = token.cancelled() => return Err(Error::Cancelled),
                        res = self.source.create(desired) => res,
                    };
                    match created {
                        Ok(created) => {
                            info!("Created {} {}", self.kind, key);
                            break (BootstrapOutcome::Created, created.metadata.resource_version);
                        }
                        Err(e) if e.is_already_exists() => {
                            info!("{} {} was created concurrently", self.kind, key);
                            break (BootstrapOutcome::CreatedConcurrently, None);
                        }
                        Err(cause) => return Err(Error::BootstrapFailed { key, cause }),
                    }
                }
            }
        };

        self.await_visible(token, &key, written_at.as_deref()).await?;
        Ok(outcome)
    }

    async fn await_visible(
        &self,
        token: &CancellationToken,
        key: &ObjectKey,
        at_least: Option<&str>,
    ) -> Result<(), Error> {
        let readiness = self.readiness.clone();
        let visible = self
            .store
            .wait_for(token, &self.kind, key, |obj| {
                let fresh = at_least.is_none() || !is_newer(at_least, resource_version(obj));
                fresh && readiness.as_ref().is_none_or(|ready| ready(obj))
            })
            .await?;
        match visible {
            Some(_) => {
                debug!("{} {} visible in cache", self.kind, key);
                Ok(())
            }
            None => Err(Error::BootstrapTimeout {
                kind: self.kind.clone(),
                key: key.clone(),
            }),
        }
    }

    async fn await_gone(&self, token: &CancellationToken, key: &ObjectKey) -> Result<(), Error> {
        let changes = self.store.changes(&self.kind)?;
        let store = &self.store;
        let kind = &self.kind;
        let gone = wait_for_condition(token, changes, || match store.get(kind, key) {
            Ok(Some(obj)) if is_terminating(&obj) => None,
            _ => Some(()),
        })
        .await;
        gone.ok_or_else(|| Error::BootstrapTimeout {
            kind: self.kind.clone(),
            key: key.clone(),
        })
    }

    async fn await_newer_than(
        &self,
        token: &CancellationToken,
        key: &ObjectKey,
        seen: Option<&str>,
    ) -> Result<(), Error> {
        let changes = self.store.changes(&self.kind)?;
        let store = &self.store;
        let kind = &self.kind;
        let moved = wait_for_condition(token, changes, || match store.get(kind, key) {
            Ok(Some(obj)) => is_newer(resource_version(&obj), seen).then_some(()),
            _ => Some(()),
        })
        .await;
        moved.ok_or_else(|| Error::BootstrapTimeout {
            kind: self.kind.clone(),
            key: key.clone(),
        })
    }
}

/// Whether the observed object already carries everything `desired` asks for.
///
/// Compares the payload (minus `status`) and labels/annotations. Fields the
/// control plane added on its own, such as defaults, do not count as drift.
pub fn satisfies(observed: &DynamicObject, desired: &DynamicObject) -> bool {
    let payload_ok = match desired.data.as_object() {
        Some(fields) => fields
            .iter()
            .filter(|(name, _)| name.as_str() != "status")
            .all(|(name, value)| observed.data.get(name).is_some_and(|have| is_subset(value, have))),
        None => desired.data.is_null() || desired.data == observed.data,
    };
    payload_ok
        && map_subset(desired.metadata.labels.as_ref(), observed.metadata.labels.as_ref())
        && map_subset(desired.metadata.annotations.as_ref(), observed.metadata.annotations.as_ref())
}

fn map_subset(
    want: Option<&std::collections::BTreeMap<String, String>>,
    have: Option<&std::collections::BTreeMap<String, String>>,
) -> bool {
    match want {
        None => true,
        Some(want) => want
            .iter()
            .all(|(k, v)| have.and_then(|have| have.get(k)) == Some(v)),
    }
}

fn is_subset(want: &Value, have: &Value) -> bool {
    match (want, have) {
        (Value::Object(want), Value::Object(have)) => want
            .iter()
            .all(|(k, v)| have.get(k).is_some_and(|h| is_subset(v, h))),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len() && want.iter().zip(have).all(|(w, h)| is_subset(w, h))
        }
        _ => want == have,
    }
}

fn merge_desired(observed: &DynamicObject, desired: &DynamicObject) -> DynamicObject {
    let mut merged = observed.clone();
    match (merged.data.as_object_mut(), desired.data.as_object()) {
        (Some(target), Some(fields)) => {
            for (name, value) in fields {
                if name != "status" {
                    target.insert(name.clone(), value.clone());
                }
            }
        }
        _ => merged.data = desired.data.clone(),
    }
    for (want, have) in [
        (&desired.metadata.labels, &mut merged.metadata.labels),
        (&desired.metadata.annotations, &mut merged.metadata.annotations),
    ] {
        if let Some(want) = want {
            have.get_or_insert_with(Default::default)
                .extend(want.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
    }
    merged
}
