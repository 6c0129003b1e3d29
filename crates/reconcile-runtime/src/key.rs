//! Object identity.
//!
//! Queue items and cache entries are addressed by `namespace/name`, the same
//! string form the Kubernetes tooling prints.

use crate::error::RuntimeError;
use kube::{Resource, ResourceExt};
use std::fmt;
use std::str::FromStr;

/// Identity of a namespaced (or cluster-scoped) object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key for an object in `namespace`.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object.
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of an existing object.
    pub fn from_resource<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.name_any(),
        }
    }

    /// Namespace or the empty string.
    #[must_use]
    pub fn namespace_or_empty(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() => Self::new(ns, name),
            Some(_) => return Err(RuntimeError::InvalidKey(s.to_string())),
            None => Self::cluster(s),
        };
        if key.name.is_empty() || key.name.contains('/') {
            return Err(RuntimeError::InvalidKey(s.to_string()));
        }
        Ok(key)
    }
}

/// Identity of an owner as seen from a dependent's controller reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerKey {
    /// Owner kind (e.g. `Foo`)
    pub kind: String,
    /// Owner location; owners share the dependent's namespace
    pub key: ObjectKey,
}

impl OwnerKey {
    /// Owner of `kind` named `name` in `namespace`.
    pub fn new(kind: impl Into<String>, key: ObjectKey) -> Self {
        Self {
            kind: kind.into(),
            key,
        }
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display_and_parse() {
        let key: ObjectKey = "default/web".parse().unwrap();
        assert_eq!(key, ObjectKey::new("default", "web"));
        assert_eq!(key.to_string(), "default/web");

        let cluster: ObjectKey = "node-1".parse().unwrap();
        assert_eq!(cluster.namespace, None);
        assert_eq!(cluster.to_string(), "node-1");
    }

    #[test]
    fn test_key_parse_rejects_malformed() {
        assert!("".parse::<ObjectKey>().is_err());
        assert!("/web".parse::<ObjectKey>().is_err());
        assert!("default/".parse::<ObjectKey>().is_err());
        assert!("a/b/c".parse::<ObjectKey>().is_err());
    }
}
