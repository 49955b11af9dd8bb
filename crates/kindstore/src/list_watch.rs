//! List-then-watch loop shared by cache population and the event watcher.
//!
//! The loop lists, hands the snapshot to its sink, watches from the list's
//! resource version and forwards every event. A broken or closed watch is
//! never surfaced: the loop backs off and relists. Only cancellation ends it.

use crate::backoff::FibonacciBackoff;
use crate::cache::EventType;
use crate::error::{Error, SourceError};
use crate::kind::Kind;
use crate::source::{WatchEvent, WatchSource};
use futures::StreamExt;
use kube::api::DynamicObject;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tuning for list-watch loops.
#[derive(Debug, Clone)]
pub struct ListWatchOptions {
    /// First delay before relisting after a failure
    pub min_backoff: Duration,
    /// Cap for the relist delay
    pub max_backoff: Duration,
    /// Periodic redelivery of known state, disabled when `None`
    pub resync_period: Option<Duration>,
}

impl Default for ListWatchOptions {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            resync_period: None,
        }
    }
}

/// Receiver of what a list-watch loop observes.
#[async_trait::async_trait]
pub(crate) trait EventSink: Send {
    /// A full list landed
    async fn replace(&mut self, items: Vec<DynamicObject>, resource_version: Option<&str>);

    /// One watch event
    async fn apply(&mut self, event: EventType, obj: DynamicObject);

    /// Resync timer fired
    async fn resync(&mut self);
}

enum Interrupted {
    Cancelled,
    Disconnected(Error),
}

fn disconnected(kind: &Kind, during: &str, cause: &SourceError) -> Interrupted {
    Interrupted::Disconnected(Error::WatchDisconnected {
        kind: kind.clone(),
        reason: format!("{during}: {cause}"),
    })
}

/// Drive `sink` from `source` until `token` is cancelled.
pub(crate) async fn run_list_watch<S: EventSink>(
    kind: &Kind,
    source: Arc<dyn WatchSource>,
    sink: &mut S,
    token: &CancellationToken,
    options: &ListWatchOptions,
) {
    let mut backoff = FibonacciBackoff::new(options.min_backoff, options.max_backoff);
    let mut resync = options.resync_period.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    info!("Starting list-watch for {}", kind);
    loop {
        match list_and_watch(kind, source.as_ref(), sink, token, &mut backoff, resync.as_mut()).await {
            Interrupted::Cancelled => break,
            Interrupted::Disconnected(e) => {
                let delay = backoff.next_backoff();
                warn!("{}; relisting in {:?}", e, delay);
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    info!("List-watch for {} stopped", kind);
}

async fn list_and_watch<S: EventSink>(
    kind: &Kind,
    source: &dyn WatchSource,
    sink: &mut S,
    token: &CancellationToken,
    backoff: &mut FibonacciBackoff,
    mut resync: Option<&mut Interval>,
) -> Interrupted {
    let listed = tokio::select! {
        biased;
        () = token.cancelled() => return Interrupted::Cancelled,
        res = source.list() => res,
    };
    let list = match listed {
        Ok(list) => list,
        Err(e) => return disconnected(kind, "list failed", &e),
    };
    debug!("Listed {} {} objects", list.items.len(), kind);
    let mut resource_version = list.resource_version;
    sink.replace(list.items, resource_version.as_deref()).await;

    let opened = tokio::select! {
        biased;
        () = token.cancelled() => return Interrupted::Cancelled,
        res = source.watch(resource_version.as_deref()) => res,
    };
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => return disconnected(kind, "watch failed to open", &e),
    };
    backoff.reset();

    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => return Interrupted::Cancelled,
            () = tick(resync.as_deref_mut()) => sink.resync().await,
            next = stream.next() => match next {
                Some(Ok(event)) => {
                    if let Some(rv) = event.resource_version() {
                        resource_version = Some(rv.to_string());
                    }
                    match event {
                        WatchEvent::Added(obj) => sink.apply(EventType::Added, obj).await,
                        WatchEvent::Modified(obj) => sink.apply(EventType::Updated, obj).await,
                        WatchEvent::Deleted(obj) => sink.apply(EventType::Deleted, obj).await,
                        WatchEvent::Bookmark(_) => {}
                    }
                }
                Some(Err(e)) => {
                    debug!("Watch of {} broke at {:?}", kind, resource_version);
                    return disconnected(kind, "watch broke", &e);
                }
                None => {
                    debug!("Watch of {} closed at {:?}", kind, resource_version);
                    return Interrupted::Disconnected(Error::WatchDisconnected {
                        kind: kind.clone(),
                        reason: "watch closed by server".to_string(),
                    });
                }
            }
        }
    }
}

async fn tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockWatchSource;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Counting {
        replaced: Arc<Mutex<usize>>,
    }

    #[async_trait::async_trait]
    impl EventSink for Counting {
        async fn replace(&mut self, _items: Vec<DynamicObject>, _resource_version: Option<&str>) {
            *self.replaced.lock() += 1;
        }

        async fn apply(&mut self, _event: EventType, _obj: DynamicObject) {}

        async fn resync(&mut self) {}
    }

    #[test]
    fn test_disconnect_names_kind_and_cause() {
        let kind = Kind::new("ext", "v1beta1", "Widget");
        let Interrupted::Disconnected(err) =
            disconnected(&kind, "list failed", &SourceError::Api("boom".to_string()))
        else {
            panic!("expected a disconnect");
        };
        assert!(matches!(&err, Error::WatchDisconnected { kind: k, .. } if *k == kind));
        assert_eq!(
            err.to_string(),
            "watch disconnected for ext/v1beta1.Widget: list failed: api error: boom"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_lists_are_retried_until_cancelled() {
        let kind = Kind::new("ext", "v1beta1", "Widget");
        let source = Arc::new(MockWatchSource::new(kind.clone()));
        source.fail_next_lists(3);
        let options = ListWatchOptions {
            min_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            resync_period: None,
        };
        let token = CancellationToken::new();
        let replaced = Arc::new(Mutex::new(0));
        let mut sink = Counting {
            replaced: Arc::clone(&replaced),
        };

        let run = {
            let token = token.clone();
            let source: Arc<dyn WatchSource> = source.clone();
            tokio::spawn(async move {
                run_list_watch(&kind, source, &mut sink, &token, &options).await;
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.list_calls(), 4);
        assert_eq!(*replaced.lock(), 1);

        token.cancel();
        run.await.unwrap();
    }
}
