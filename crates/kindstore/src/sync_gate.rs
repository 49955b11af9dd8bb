//! Blocking waits over cache state.
//!
//! [`wait_for_sync`] blocks until a set of caches report their initial list
//! landed. [`wait_for_condition`] blocks until a predicate over cache state
//! holds. Both are driven by `watch` channel notifications rather than
//! polling, and both give up as soon as the cancellation token fires.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Something that reports whether its initial list has landed.
pub trait SyncedChecker: Send + Sync {
    /// Current value of the synced flag
    fn has_synced(&self) -> bool;

    /// Receiver that observes the synced flag
    fn synced_signal(&self) -> watch::Receiver<bool>;
}

/// Detached view of one cache's synced flag.
///
/// Holding a handle does not keep the cache itself reachable.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    label: String,
    synced: watch::Receiver<bool>,
}

impl SyncHandle {
    pub(crate) fn new(label: String, synced: watch::Receiver<bool>) -> Self {
        Self { label, synced }
    }

    /// What this handle tracks, for logs
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl SyncedChecker for SyncHandle {
    fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    fn synced_signal(&self) -> watch::Receiver<bool> {
        self.synced.clone()
    }
}

impl SyncedChecker for crate::cache::ResourceCache {
    fn has_synced(&self) -> bool {
        self.is_synced()
    }

    fn synced_signal(&self) -> watch::Receiver<bool> {
        self.subscribe_synced()
    }
}

/// Wait until every checker reports synced.
///
/// Returns `false` as soon as `token` is cancelled, even if some caches are
/// already synced. A checker whose sender is gone without ever syncing also
/// yields `false`, since it can no longer become ready.
pub async fn wait_for_sync(token: &CancellationToken, checkers: &[&dyn SyncedChecker]) -> bool {
    for checker in checkers {
        let mut signal = checker.synced_signal();
        let synced = tokio::select! {
            biased;
            () = token.cancelled() => return false,
            res = signal.wait_for(|synced| *synced) => res.is_ok(),
        };
        if !synced {
            return false;
        }
    }
    debug!("{} cache(s) synced", checkers.len());
    true
}

/// Wait until `probe` yields a value, re-evaluating after every change
/// published on `changes`.
///
/// Returns `None` when `token` is cancelled first or the change sender is
/// dropped while the probe still fails.
pub async fn wait_for_condition<T, F>(
    token: &CancellationToken,
    mut changes: watch::Receiver<u64>,
    mut probe: F,
) -> Option<T>
where
    F: FnMut() -> Option<T>,
{
    loop {
        // Mark the current generation seen before probing, so a change that
        // lands between the probe and the await still wakes us.
        changes.borrow_and_update();
        if let Some(value) = probe() {
            return Some(value);
        }
        tokio::select! {
            biased;
            () = token.cancelled() => return None,
            res = changes.changed() => {
                if res.is_err() {
                    return probe();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResourceCache;
    use crate::kind::Kind;
    use kube::api::DynamicObject;
    use std::sync::Arc;
    use std::time::Duration;

    fn cache(kind: &str) -> Arc<ResourceCache> {
        Arc::new(ResourceCache::new(
            Kind::new("ext", "v1beta1", kind),
            Arc::new(DynamicObject::clone),
        ))
    }

    #[tokio::test]
    async fn test_returns_true_when_already_synced() {
        let a = cache("A");
        a.mark_synced();
        let token = CancellationToken::new();
        assert!(wait_for_sync(&token, &[&*a]).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_false_when_cancelled_before_sync() {
        let a = cache("A");
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let res = tokio::time::timeout(Duration::from_secs(2), wait_for_sync(&token, &[&*a])).await;
        assert_eq!(res.ok(), Some(false));
    }

    #[tokio::test]
    async fn test_cancelled_token_wins_over_synced_cache() {
        let a = cache("A");
        a.mark_synced();
        let token = CancellationToken::new();
        token.cancel();
        assert!(!wait_for_sync(&token, &[&*a]).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_all_regardless_of_order() {
        let a = cache("A");
        let b = cache("B");
        let token = CancellationToken::new();

        let (a2, b2) = (Arc::clone(&a), Arc::clone(&b));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            b2.mark_synced();
            tokio::time::sleep(Duration::from_millis(10)).await;
            a2.mark_synced();
        });

        let handle_b = SyncHandle::new("B".to_string(), b.subscribe_synced());
        assert!(wait_for_sync(&token, &[&*a, &handle_b]).await);
        assert!(a.is_synced() && b.is_synced());
    }

    #[tokio::test(start_paused = true)]
    async fn test_condition_wakes_on_change() {
        let (tx, rx) = watch::channel(0u64);
        let token = CancellationToken::new();
        let value = Arc::new(parking_lot::Mutex::new(None::<u32>));

        let writer = Arc::clone(&value);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            *writer.lock() = Some(7);
            tx.send_modify(|g| *g += 1);
            // keep the sender alive until the waiter has seen it
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let got = wait_for_condition(&token, rx, || *value.lock()).await;
        assert_eq!(got, Some(7));
    }

    #[tokio::test]
    async fn test_condition_gives_up_on_cancel() {
        let (_tx, rx) = watch::channel(0u64);
        let token = CancellationToken::new();
        token.cancel();
        let got: Option<()> = wait_for_condition(&token, rx, || None).await;
        assert!(got.is_none());
    }
}
