//! Startup sequencing and ordered teardown.
//!
//! Startup: register the definition kind, start the store, wait for its
//! cache to sync, ensure the definition exists, then start the dependent
//! watcher. Teardown: stop and join the watcher (its handler drains its own
//! work), then stop the store and wait for its acknowledgement.

use crate::bootstrap::{ExistenceBootstrapper, Readiness};
use crate::error::Error;
use crate::kind::Kind;
use crate::list_watch::ListWatchOptions;
use crate::scheme::Scheme;
use crate::source::WatchSource;
use crate::store::MultiKindStore;
use crate::sync_gate::wait_for_sync;
use crate::watcher::{EventWatcher, ReactionHandler};
use kube::api::DynamicObject;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// The definition object that must exist before dependents are watched.
pub struct Bootstrap {
    /// Kind of the definition object (e.g. `CustomResourceDefinition`)
    pub kind: Kind,
    /// Source for the definition kind
    pub source: Arc<dyn WatchSource>,
    /// Desired definition
    pub definition: DynamicObject,
    /// Optional readiness check on the cached definition
    pub readiness: Option<Readiness>,
}

/// The kind whose events drive the handler.
pub struct Dependent {
    /// Kind defined by the bootstrapped definition
    pub kind: Kind,
    /// Source for the dependent kind
    pub source: Arc<dyn WatchSource>,
    /// Reaction to changes of the dependent kind
    pub handler: Arc<dyn ReactionHandler>,
}

/// Wires store, bootstrapper and watcher under one cancellation token.
#[derive(Debug, Clone)]
pub struct Supervisor {
    scheme: Arc<Scheme>,
    options: ListWatchOptions,
}

impl Supervisor {
    /// Supervisor whose store decodes through `scheme` and whose list-watch
    /// loops use `options`.
    pub fn new(scheme: Arc<Scheme>, options: ListWatchOptions) -> Self {
        Self { scheme, options }
    }

    /// Run until `token` is cancelled.
    ///
    /// Always tears down in order before returning: watcher joined first,
    /// store second. A normal shutdown returns [`Error::Cancelled`]; any
    /// other error is a startup failure.
    pub async fn run(
        &self,
        token: CancellationToken,
        bootstrap: Bootstrap,
        dependent: Dependent,
    ) -> Result<(), Error> {
        let store = Arc::new(MultiKindStore::new(Arc::clone(&self.scheme), self.options.clone()));
        store.register(bootstrap.kind.clone(), Arc::clone(&bootstrap.source))?;

        // The store gets its own token so it outlives the watcher during teardown.
        let store_token = CancellationToken::new();
        let (stopped_tx, stopped_rx) = oneshot::channel();
        let store_task = tokio::spawn(Arc::clone(&store).run(store_token.clone(), move || {
            let _ = stopped_tx.send(());
        }));
        let run_scope = token.child_token();

        let (watcher, outcome) = match self.start(&run_scope, &store, bootstrap, dependent).await {
            Ok(watcher) => {
                run_scope.cancelled().await;
                info!("Shutdown requested");
                (Some(watcher), Error::Cancelled)
            }
            Err(e) => {
                if !e.is_cancelled() {
                    error!("Startup failed: {}", e);
                }
                (None, e)
            }
        };

        teardown(run_scope, watcher, store_token, store_task, stopped_rx).await;
        Err(outcome)
    }

    async fn start(
        &self,
        scope: &CancellationToken,
        store: &Arc<MultiKindStore>,
        bootstrap: Bootstrap,
        dependent: Dependent,
    ) -> Result<EventWatcher, Error> {
        let handle = store.sync_handle(&bootstrap.kind)?;
        info!("Waiting for {} cache to sync", bootstrap.kind);
        if !wait_for_sync(scope, &[&handle]).await {
            return Err(Error::Cancelled);
        }

        let mut bootstrapper =
            ExistenceBootstrapper::new(Arc::clone(store), bootstrap.kind.clone(), bootstrap.source);
        if let Some(readiness) = bootstrap.readiness {
            bootstrapper = bootstrapper.with_readiness(readiness);
        }
        let outcome = bootstrapper.ensure(scope, &bootstrap.definition).await?;
        info!("Definition for {} ready ({:?})", dependent.kind, outcome);

        let mut watcher =
            EventWatcher::new(dependent.kind, dependent.source, dependent.handler, self.options.clone());
        watcher.start(scope)?;
        Ok(watcher)
    }
}

async fn teardown(
    run_scope: CancellationToken,
    watcher: Option<EventWatcher>,
    store_token: CancellationToken,
    store_task: JoinHandle<Result<(), Error>>,
    stopped: oneshot::Receiver<()>,
) {
    run_scope.cancel();
    if let Some(watcher) = watcher {
        watcher.join().await;
    }

    store_token.cancel();
    match store_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Store exited with error: {}", e),
        Err(e) => error!("Store task failed: {}", e),
    }
    if stopped.await.is_err() {
        warn!("Store exited without acknowledging shutdown");
    }
    info!("Teardown complete");
}
