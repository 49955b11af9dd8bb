//! Explicit type registry.
//!
//! A [`Scheme`] maps each [`Kind`] to what the engine needs to talk about
//! objects of that kind without knowing their shape: the REST resource for
//! building sources, the scope, and a deep-copy capability used when the
//! store hands objects to callers. It is built once at startup and passed
//! by `Arc` to whoever needs it.

use crate::error::Error;
use crate::kind::Kind;
use kube::api::{ApiResource, DynamicObject};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Copies an object so the result shares nothing with the source.
pub type DeepCopyFn = Arc<dyn Fn(&DynamicObject) -> DynamicObject + Send + Sync>;

/// Whether objects of a kind live in a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Cluster-wide objects (namespace is always empty)
    Cluster,
    /// Namespaced objects
    Namespaced,
}

/// Everything the scheme knows about one kind.
#[derive(Clone)]
pub struct KindInfo {
    /// REST resource (plural, api version) used to reach the kind
    pub resource: ApiResource,
    /// Scope of the kind
    pub scope: Scope,
    deep_copy: DeepCopyFn,
}

impl fmt::Debug for KindInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindInfo")
            .field("resource", &self.resource)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Registry of known kinds.
#[derive(Debug, Clone, Default)]
pub struct Scheme {
    kinds: HashMap<Kind, KindInfo>,
}

impl Scheme {
    /// Create an empty scheme
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a kind reachable through `resource`, copied with `Clone`.
    #[must_use]
    pub fn with_kind(mut self, kind: Kind, resource: ApiResource, scope: Scope) -> Self {
        self.kinds.insert(
            kind,
            KindInfo {
                resource,
                scope,
                deep_copy: Arc::new(DynamicObject::clone),
            },
        );
        self
    }

    /// Register a statically typed resource.
    #[must_use]
    pub fn with_type<K>(self, scope: Scope) -> Self
    where
        K: kube::Resource<DynamicType = ()>,
    {
        self.with_kind(Kind::of::<K>(), ApiResource::erase::<K>(&()), scope)
    }

    /// Override how objects of `kind` are deep-copied.
    ///
    /// Has no effect on kinds that were never registered.
    #[must_use]
    pub fn with_deep_copy(mut self, kind: &Kind, copy: DeepCopyFn) -> Self {
        if let Some(info) = self.kinds.get_mut(kind) {
            info.deep_copy = copy;
        }
        self
    }

    /// Look up a kind
    pub fn get(&self, kind: &Kind) -> Result<&KindInfo, Error> {
        self.kinds
            .get(kind)
            .ok_or_else(|| Error::UnknownKind(kind.clone()))
    }

    /// The deep-copy capability for `kind`. Unknown kinds fall back to `Clone`,
    /// which is a full copy for `DynamicObject`.
    pub fn copier(&self, kind: &Kind) -> DeepCopyFn {
        self.kinds
            .get(kind)
            .map_or_else(|| Arc::new(DynamicObject::clone) as DeepCopyFn, |info| Arc::clone(&info.deep_copy))
    }

    /// Decode a dynamic object into a concrete resource type.
    pub fn decode<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K, Error> {
        Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
    }

    /// Encode a concrete resource into a dynamic object.
    pub fn encode<K: Serialize>(obj: &K) -> Result<DynamicObject, Error> {
        Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn widget_kind() -> Kind {
        Kind::new("ext", "v1beta1", "Widget")
    }

    fn widget_scheme() -> Scheme {
        let kind = widget_kind();
        let ar = ApiResource::from_gvk(&kind.to_gvk());
        Scheme::new().with_kind(kind, ar, Scope::Namespaced)
    }

    #[test]
    fn test_unknown_kind_lookup_fails() {
        let scheme = widget_scheme();
        let other = Kind::new("ext", "v1beta1", "Gadget");
        assert!(matches!(scheme.get(&other), Err(Error::UnknownKind(k)) if k == other));
        assert_eq!(scheme.get(&widget_kind()).unwrap().scope, Scope::Namespaced);
    }

    #[test]
    fn test_custom_deep_copy_is_used() {
        let kind = widget_kind();
        let scheme = widget_scheme().with_deep_copy(
            &kind,
            Arc::new(|obj: &DynamicObject| {
                let mut copy = obj.clone();
                copy.metadata.managed_fields = None;
                copy
            }),
        );
        let ar = scheme.get(&kind).unwrap().resource.clone();
        let mut obj = DynamicObject::new("w1", &ar);
        obj.metadata.managed_fields = Some(Vec::new());
        let copy = (scheme.copier(&kind))(&obj);
        assert!(copy.metadata.managed_fields.is_none());
    }

    #[test]
    fn test_decode_into_typed_value() {
        #[derive(serde::Deserialize)]
        struct Widget {
            spec: WidgetSpec,
        }
        #[derive(serde::Deserialize)]
        struct WidgetSpec {
            size: u32,
        }

        let ar = ApiResource::from_gvk(&widget_kind().to_gvk());
        let obj = DynamicObject::new("w1", &ar).data(json!({ "spec": { "size": 3 } }));
        let widget: Widget = Scheme::decode(&obj).unwrap();
        assert_eq!(widget.spec.size, 3);
    }
}
