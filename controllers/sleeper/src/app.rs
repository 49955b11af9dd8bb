//! Controller wiring.
//!
//! Bootstraps the Sleeper CRD through a cache of all CRDs, then watches
//! Sleepers and hands them to [`SleeperHandler`].

use crate::config::Config;
use crate::error::ControllerError;
use crate::handler::{KubeStatusWriter, SleeperHandler};
use crds::Sleeper;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kindstore::{Bootstrap, Dependent, Kind, KubeSource, Readiness, Scheme, Scope, Supervisor, WatchSource};
use kube::api::DynamicObject;
use kube::Client;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// The Sleeper controller.
pub struct App {
    client: Client,
    config: Config,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App").field("config", &self.config).finish_non_exhaustive()
    }
}

impl App {
    /// Connect to the cluster using the ambient kubeconfig or service account.
    pub async fn new(config: Config) -> Result<Self, ControllerError> {
        let client = Client::try_default().await?;
        Ok(Self { client, config })
    }

    /// Run until `token` is cancelled.
    ///
    /// Returns the store's `Cancelled` error on a requested shutdown.
    pub async fn run(self, token: CancellationToken) -> Result<(), ControllerError> {
        let crd_kind = Kind::of::<CustomResourceDefinition>();
        let sleeper_kind = Kind::of::<Sleeper>();
        let scheme = Arc::new(
            Scheme::new()
                .with_type::<CustomResourceDefinition>(Scope::Cluster)
                .with_type::<Sleeper>(Scope::Namespaced),
        );

        let crd_source = KubeSource::new(self.client.clone(), &scheme, crd_kind.clone(), None)?;
        let sleeper_source =
            KubeSource::new(self.client.clone(), &scheme, sleeper_kind.clone(), self.config.namespace.clone())?;
        info!("Sleepers are read from {}", sleeper_source.describe());

        let bootstrap = Bootstrap {
            kind: crd_kind,
            source: Arc::new(crd_source),
            definition: Scheme::encode(&crds::definition())?,
            readiness: Some(established()),
        };
        let handler = SleeperHandler::new(Arc::new(KubeStatusWriter::new(self.client)), token.child_token());
        let dependent = Dependent {
            kind: sleeper_kind,
            source: Arc::new(sleeper_source),
            handler: Arc::new(handler),
        };

        let supervisor = Supervisor::new(scheme, self.config.list_watch_options());
        supervisor.run(token, bootstrap, dependent).await?;
        Ok(())
    }
}

/// A CRD is usable once the API server reports `Established=True`.
fn established() -> Readiness {
    Arc::new(is_established)
}

fn is_established(crd: &DynamicObject) -> bool {
    crd.data
        .pointer("/status/conditions")
        .and_then(|conditions| conditions.as_array())
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some("Established")
                    && c.get("status").and_then(|s| s.as_str()) == Some("True")
            })
        })
}
