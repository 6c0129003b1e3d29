//! Kind registry.
//!
//! The table of kinds this process knows how to describe, built once at
//! startup and handed to whoever needs type metadata (event recording, owner
//! references). Nothing is registered implicitly.

use crate::error::RegistryError;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use tracing::debug;

/// Type metadata of a registered kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindInfo {
    /// API group (`""` for core)
    pub group: String,
    /// API version within the group
    pub version: String,
    /// Kind name
    pub kind: String,
    /// Plural resource name
    pub plural: String,
}

impl KindInfo {
    /// `group/version`, or just `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

/// Registration table of known kinds.
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    kinds: BTreeMap<String, KindInfo>,
}

impl KindRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `K`. Re-registering a kind replaces its entry.
    #[must_use]
    pub fn register<K: Resource<DynamicType = ()>>(mut self) -> Self {
        let info = KindInfo {
            group: K::group(&()).into_owned(),
            version: K::version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            plural: K::plural(&()).into_owned(),
        };
        debug!("Registered kind {} ({})", info.kind, info.api_version());
        self.kinds.insert(info.kind.clone(), info);
        self
    }

    /// Metadata of `kind`.
    pub fn lookup(&self, kind: &str) -> Option<&KindInfo> {
        self.kinds.get(kind)
    }

    /// True when `kind` was registered.
    pub fn is_registered(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Registered kind names, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        self.kinds.keys().map(String::as_str).collect()
    }

    /// Reference to `obj`, suitable as an event subject.
    pub fn object_reference<K: Resource<DynamicType = ()>>(
        &self,
        obj: &K,
    ) -> Result<ObjectReference, RegistryError> {
        let kind = K::kind(&());
        let info = self
            .lookup(&kind)
            .ok_or_else(|| RegistryError::UnregisteredKind(kind.to_string()))?;
        if obj.meta().name.is_none() {
            return Err(RegistryError::MissingName(kind.to_string()));
        }
        Ok(ObjectReference {
            api_version: Some(info.api_version()),
            kind: Some(info.kind.clone()),
            name: Some(obj.name_any()),
            namespace: obj.namespace(),
            uid: obj.meta().uid.clone(),
            resource_version: obj.resource_version(),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_register_and_lookup() {
        let registry = KindRegistry::new().register::<Deployment>().register::<ConfigMap>();

        let info = registry.lookup("Deployment").unwrap();
        assert_eq!(info.api_version(), "apps/v1");
        assert_eq!(info.plural, "deployments");
        assert_eq!(registry.lookup("ConfigMap").unwrap().api_version(), "v1");
        assert_eq!(registry.kinds(), vec!["ConfigMap", "Deployment"]);
    }

    #[test]
    fn test_object_reference_requires_registration() {
        let registry = KindRegistry::new().register::<ConfigMap>();
        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("uid-1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        assert_eq!(
            registry.object_reference(&deployment),
            Err(RegistryError::UnregisteredKind("Deployment".to_string()))
        );

        let registry = registry.register::<Deployment>();
        let reference = registry.object_reference(&deployment).unwrap();
        assert_eq!(reference.kind.as_deref(), Some("Deployment"));
        assert_eq!(reference.api_version.as_deref(), Some("apps/v1"));
        assert_eq!(reference.namespace.as_deref(), Some("default"));
        assert_eq!(reference.uid.as_deref(), Some("uid-1"));
    }
}
