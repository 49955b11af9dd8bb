//! Identity of cached objects: which kind they belong to and which key
//! they live under inside that kind's cache.

use crate::error::Error;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Identifies a class of cluster-managed objects (group, version, kind).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Kind {
    /// API group, empty for the core group
    pub group: String,
    /// API version within the group
    pub version: String,
    /// Kind name, e.g. `CustomResourceDefinition`
    pub kind: String,
}

impl Kind {
    /// Create a kind from its three parts
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            kind: kind.into(),
        }
    }

    /// Kind of a statically typed resource such as a derived custom resource.
    pub fn of<K>() -> Self
    where
        K: kube::Resource<DynamicType = ()>,
    {
        Self::new(K::group(&()), K::version(&()), K::kind(&()))
    }

    /// `group/version`, or just `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Convert into kube's representation
    pub fn to_gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }
}

impl From<GroupVersionKind> for Kind {
    fn from(gvk: GroupVersionKind) -> Self {
        Self::new(gvk.group, gvk.version, gvk.kind)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.api_version(), self.kind)
    }
}

/// Location of one object within a kind's cache.
///
/// The namespace is empty for cluster-scoped objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ObjectKey {
    /// Namespace, empty when cluster-scoped
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key for a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object
    pub fn cluster(name: impl Into<String>) -> Self {
        Self::namespaced(String::new(), name)
    }

    /// Derive the key of a dynamic object from its metadata.
    pub fn from_object(obj: &DynamicObject) -> Result<Self, Error> {
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::InvalidObject("object has no metadata.name".to_string()))?;
        Ok(Self {
            namespace: obj.metadata.namespace.clone().unwrap_or_default(),
            name,
        })
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Compare two resource versions.
///
/// Versions that both parse as unsigned integers compare numerically.
/// Anything else falls back to length first, then lexical order, which
/// agrees with numeric order for decimal strings without leading zeros.
pub fn compare_resource_versions(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
    }
}

/// Resource version of an object, if the control plane assigned one.
pub fn resource_version(obj: &DynamicObject) -> Option<&str> {
    obj.metadata.resource_version.as_deref()
}

/// Whether `incoming` is strictly newer than `stored`.
///
/// An incoming object without a version cannot be ordered and is treated
/// as newer; a stored object without a version is always superseded.
pub fn is_newer(incoming: Option<&str>, stored: Option<&str>) -> bool {
    match (incoming, stored) {
        (Some(a), Some(b)) => compare_resource_versions(a, b) == Ordering::Greater,
        _ => true,
    }
}

/// Whether the object is in graceful deletion.
pub fn is_terminating(obj: &DynamicObject) -> bool {
    obj.metadata.deletion_timestamp.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ApiResource;

    #[test]
    fn test_kind_equality_needs_all_fields() {
        let a = Kind::new("ext", "v1beta1", "Widget");
        assert_eq!(a, Kind::new("ext", "v1beta1", "Widget"));
        assert_ne!(a, Kind::new("ext", "v1", "Widget"));
        assert_ne!(a, Kind::new("other", "v1beta1", "Widget"));
        assert_ne!(a, Kind::new("ext", "v1beta1", "Gadget"));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(Kind::new("ext", "v1beta1", "Widget").to_string(), "ext/v1beta1.Widget");
        assert_eq!(Kind::new("", "v1", "ConfigMap").to_string(), "v1.ConfigMap");
    }

    #[test]
    fn test_kind_gvk_conversion() {
        let kind = Kind::new("apiextensions.k8s.io", "v1", "CustomResourceDefinition");
        assert_eq!(Kind::from(kind.to_gvk()), kind);
    }

    #[test]
    fn test_object_key_from_object() {
        let ar = ApiResource::from_gvk(&Kind::new("ext", "v1", "Widget").to_gvk());
        let obj = DynamicObject::new("w1", &ar).within("team-a");
        let key = ObjectKey::from_object(&obj).unwrap();
        assert_eq!(key, ObjectKey::namespaced("team-a", "w1"));
        assert_eq!(key.to_string(), "team-a/w1");

        let cluster = DynamicObject::new("w2", &ar);
        assert_eq!(ObjectKey::from_object(&cluster).unwrap().to_string(), "w2");
    }

    #[test]
    fn test_object_key_requires_name() {
        let ar = ApiResource::from_gvk(&Kind::new("ext", "v1", "Widget").to_gvk());
        let mut obj = DynamicObject::new("w1", &ar);
        obj.metadata.name = None;
        assert!(matches!(ObjectKey::from_object(&obj), Err(Error::InvalidObject(_))));
    }

    #[test]
    fn test_resource_version_ordering() {
        assert_eq!(compare_resource_versions("9", "10"), Ordering::Less);
        assert_eq!(compare_resource_versions("10", "10"), Ordering::Equal);
        assert_eq!(compare_resource_versions("abc", "abd"), Ordering::Less);
        assert_eq!(compare_resource_versions("zz", "aaa"), Ordering::Less);
        assert!(is_newer(Some("2"), Some("1")));
        assert!(!is_newer(Some("1"), Some("2")));
        assert!(!is_newer(Some("2"), Some("2")));
        assert!(is_newer(None, Some("5")));
        assert!(is_newer(Some("1"), None));
    }
}
