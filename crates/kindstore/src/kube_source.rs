//! [`WatchSource`] backed by a Kubernetes API server.

use crate::error::{Error, SourceError};
use crate::kind::Kind;
use crate::scheme::{Scheme, Scope};
use crate::source::{EventStream, ObjectList, WatchEvent, WatchSource};
use futures::StreamExt;
use kube::api::{Api, ApiResource, DynamicObject, ListParams, PostParams, WatchParams};
use kube::Client;
use tracing::debug;

/// Lists, watches and writes one kind through the API server.
///
/// With a namespace set, reads are limited to it. Writes of namespaced
/// objects always go to the object's own namespace.
#[derive(Clone)]
pub struct KubeSource {
    client: Client,
    kind: Kind,
    resource: ApiResource,
    scope: Scope,
    namespace: Option<String>,
}

impl std::fmt::Debug for KubeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeSource")
            .field("kind", &self.kind)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl KubeSource {
    /// Source for `kind`, which must be registered in `scheme`.
    ///
    /// `namespace` is ignored for cluster-scoped kinds.
    pub fn new(client: Client, scheme: &Scheme, kind: Kind, namespace: Option<String>) -> Result<Self, Error> {
        let info = scheme.get(&kind)?;
        let namespace = match info.scope {
            Scope::Namespaced => namespace,
            Scope::Cluster => None,
        };
        Ok(Self {
            client,
            resource: info.resource.clone(),
            scope: info.scope,
            kind,
            namespace,
        })
    }

    fn read_api(&self) -> Api<DynamicObject> {
        match &self.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &self.resource),
            None => Api::all_with(self.client.clone(), &self.resource),
        }
    }

    fn write_api(&self, obj: &DynamicObject) -> Api<DynamicObject> {
        match (self.scope, obj.metadata.namespace.as_deref()) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &self.resource),
            _ => self.read_api(),
        }
    }
}

/// Map API errors to the cases callers branch on.
fn classify(err: kube::Error) -> SourceError {
    match &err {
        kube::Error::Api(status) if status.code == 409 && status.reason == "AlreadyExists" => {
            SourceError::AlreadyExists(status.message.clone())
        }
        kube::Error::Api(status) if status.code == 409 => SourceError::Conflict(status.message.clone()),
        kube::Error::Api(status) if status.code == 410 => SourceError::Gone(status.message.clone()),
        _ => SourceError::Kube(err),
    }
}

fn object_name(obj: &DynamicObject) -> Result<&str, SourceError> {
    obj.metadata
        .name
        .as_deref()
        .ok_or_else(|| SourceError::Api("object has no name".to_string()))
}

#[async_trait::async_trait]
impl WatchSource for KubeSource {
    fn describe(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{} in {}", self.resource.plural, ns),
            None => self.resource.plural.clone(),
        }
    }

    async fn list(&self) -> Result<ObjectList, SourceError> {
        let list = self.read_api().list(&ListParams::default()).await.map_err(classify)?;
        Ok(ObjectList {
            items: list.items,
            resource_version: list.metadata.resource_version,
        })
    }

    async fn watch(&self, resource_version: Option<&str>) -> Result<EventStream, SourceError> {
        let version = resource_version.unwrap_or("0");
        debug!("Watching {} from {}", self.describe(), version);
        let stream = self
            .read_api()
            .watch(&WatchParams::default(), version)
            .await
            .map_err(classify)?;

        Ok(stream
            .map(|item| match item {
                Ok(kube::api::WatchEvent::Added(obj)) => Ok(WatchEvent::Added(obj)),
                Ok(kube::api::WatchEvent::Modified(obj)) => Ok(WatchEvent::Modified(obj)),
                Ok(kube::api::WatchEvent::Deleted(obj)) => Ok(WatchEvent::Deleted(obj)),
                Ok(kube::api::WatchEvent::Bookmark(bookmark)) => {
                    Ok(WatchEvent::Bookmark(bookmark.metadata.resource_version))
                }
                Ok(kube::api::WatchEvent::Error(status)) if status.code == 410 => {
                    Err(SourceError::Gone(status.message.clone()))
                }
                Ok(kube::api::WatchEvent::Error(status)) => Err(SourceError::Disconnected(format!(
                    "{} ({})",
                    status.message, status.code
                ))),
                Err(e) => Err(classify(e)),
            })
            .boxed())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, SourceError> {
        self.write_api(obj)
            .create(&PostParams::default(), obj)
            .await
            .map_err(classify)
    }

    async fn replace(&self, obj: &DynamicObject) -> Result<DynamicObject, SourceError> {
        let name = object_name(obj)?;
        self.write_api(obj)
            .replace(name, &PostParams::default(), obj)
            .await
            .map_err(classify)
    }
}
