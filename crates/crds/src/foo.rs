//! Foo CRD
//!
//! Declares a Deployment the controller should keep in sync: its name and,
//! optionally, its replica count. The controller reports the Deployment's
//! available replicas back into the status.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of the Foo resource.
pub const FOO_GROUP: &str = "samplecontroller.k8s.io";

/// API version of the Foo resource.
pub const FOO_VERSION: &str = "v1alpha1";

/// Kind of the Foo resource, as it appears in owner references.
pub const FOO_KIND: &str = "Foo";

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "samplecontroller.k8s.io",
    version = "v1alpha1",
    kind = "Foo",
    plural = "foos",
    namespaced,
    status = "FooStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Deployment","type":"string","jsonPath":".spec.deploymentName"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.availableReplicas"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FooSpec {
    /// Name of the Deployment owned by this Foo.
    ///
    /// Required. An empty value is accepted by the API server but rejected
    /// by the controller until the Foo is edited.
    #[serde(default)]
    pub deployment_name: String,

    /// Desired replica count. Left to the Deployment when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FooStatus {
    /// Available replicas last observed on the owned Deployment
    #[serde(default)]
    pub available_replicas: i32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;
    use kube::Resource;

    #[test]
    fn test_foo_spec_missing_deployment_name_defaults_empty() {
        let spec: FooSpec = serde_json::from_value(serde_json::json!({ "replicas": 2 }))
            .unwrap();
        assert_eq!(spec.deployment_name, "");
        assert_eq!(spec.replicas, Some(2));
    }

    #[test]
    fn test_foo_spec_uses_camel_case() {
        let spec = FooSpec {
            deployment_name: "web".to_string(),
            replicas: None,
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value, serde_json::json!({ "deploymentName": "web" }));
    }

    #[test]
    fn test_foo_type_metadata_matches_constants() {
        assert_eq!(Foo::group(&()), FOO_GROUP);
        assert_eq!(Foo::version(&()), FOO_VERSION);
        assert_eq!(Foo::kind(&()), FOO_KIND);
        assert_eq!(Foo::plural(&()), "foos");
    }

    #[test]
    fn test_foo_crd_has_status_subresource() {
        let crd = Foo::crd();
        let version = &crd.spec.versions[0];
        assert_eq!(version.name, FOO_VERSION);
        assert!(
            version
                .subresources
                .as_ref()
                .and_then(|s| s.status.as_ref())
                .is_some(),
            "status updates must go through the status subresource"
        );
    }
}
