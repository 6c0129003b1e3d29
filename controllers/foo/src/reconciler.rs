//! Reconciliation logic for Foo resources.
//!
//! A Foo declares a Deployment by name. Every pass re-evaluates the whole
//! pair from the caches:
//! - missing Deployment: create it, owned by the Foo
//! - Deployment owned by someone else: warning event, nothing else
//! - replica drift: rewrite the Deployment spec
//! - otherwise: copy `availableReplicas` into the Foo status
//!
//! Deployment changes are routed back to their owning Foo so its status
//! follows the Deployment.

use crate::error::ControllerError;
use async_trait::async_trait;
use crds::{Foo, FooStatus, FOO_KIND};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{Resource, ResourceExt};
use reconcile_runtime::{
    controller_of, controller_owner_ref, is_controlled_by, ChangeHandler, Dispatcher,
    ErrorSink, EventRecorder, EventSeverity, KindHandle, KindRegistry, ObjectKey, ObjectStore,
    OwnerRoutes, RemoveHandler, RouteOutcome,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Component name events are reported under
pub const CONTROLLER_AGENT_NAME: &str = "sample-controller";

/// Name the handlers are registered under
pub const HANDLER_NAME: &str = "foo-handler";

/// Event reason when a Foo fails to sync because a Deployment of the same
/// name already exists
pub const ERR_RESOURCE_EXISTS: &str = "ErrResourceExists";

/// Event message when a Deployment already exists, see [`ERR_RESOURCE_EXISTS`]
pub fn message_resource_exists(name: &str) -> String {
    format!("Resource {name:?} already exists and is not managed by Foo")
}

/// Replicas of a Deployment whose spec leaves them unset
const DEFAULT_DEPLOYMENT_REPLICAS: i32 = 1;

/// Handles Foo and Deployment changes.
pub struct Handler {
    /// Cached Deployments
    pub deployments: KindHandle<Deployment>,
    /// Writes Deployments
    pub deployment_store: Arc<dyn ObjectStore<Deployment>>,
    /// Writes Foo status
    pub foo_store: Arc<dyn ObjectStore<Foo>>,
    /// Where changed Deployments send their owners
    pub owners: OwnerRoutes,
    /// Type metadata for event subjects
    pub registry: KindRegistry,
    /// Receives events about Foos
    pub recorder: Arc<dyn EventRecorder>,
    /// Receives failures that are not retried
    pub error_sink: Arc<dyn ErrorSink>,
}

impl Handler {
    /// Reconciles one Foo. `foo` is `None` once the Foo is deleted; its
    /// Deployment is then garbage collected by the cluster.
    pub async fn on_foo_changed(
        &self,
        key: &ObjectKey,
        foo: Option<Foo>,
    ) -> Result<Option<Foo>, ControllerError> {
        let Some(foo) = foo else {
            debug!("Foo {} deleted", key);
            return Ok(None);
        };

        let deployment_name = foo.spec.deployment_name.as_str();
        if deployment_name.is_empty() {
            // Absorbed: retrying cannot help until the Foo itself changes
            self.error_sink.report_message(
                FOO_KIND,
                key,
                &format!("{key}: deployment name must be specified"),
            );
            return Ok(None);
        }

        let namespace = foo.namespace().unwrap_or_default();
        let Some(deployment) = self.deployments.get(&namespace, deployment_name) else {
            info!("Creating Deployment {}/{} for Foo {}", namespace, deployment_name, key);
            self.deployment_store.create(&new_deployment(&foo)?).await?;
            return Ok(None);
        };

        if !is_controlled_by(&deployment, &foo) {
            let subject = self.registry.object_reference(&foo)?;
            self.recorder.record(
                &subject,
                EventSeverity::Warning,
                ERR_RESOURCE_EXISTS,
                &message_resource_exists(deployment_name),
            );
            // Not an error: a retry would find the same Deployment
            return Ok(None);
        }

        let current = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .unwrap_or(DEFAULT_DEPLOYMENT_REPLICAS);
        if let Some(desired) = foo.spec.replicas.filter(|desired| *desired != current) {
            info!(
                "Foo {} replicas: {}, deployment replicas: {}",
                foo.name_any(),
                desired,
                current
            );
            self.deployment_store.update(&new_deployment(&foo)?).await?;
            return Ok(None);
        }

        self.update_foo_status(&foo, &deployment).await?;
        Ok(None)
    }

    /// Copies the Deployment's available replicas into the Foo status.
    /// No write when the status is already current.
    pub async fn update_foo_status(
        &self,
        foo: &Foo,
        deployment: &Deployment,
    ) -> Result<(), ControllerError> {
        let available = deployment
            .status
            .as_ref()
            .and_then(|status| status.available_replicas)
            .unwrap_or(0);
        let recorded = foo.status.as_ref().map_or(0, |status| status.available_replicas);
        if recorded == available {
            debug!("Foo {} status up to date", foo.name_any());
            return Ok(());
        }

        let mut foo_copy = foo.clone();
        foo_copy.status = Some(FooStatus {
            available_replicas: available,
        });
        self.foo_store.update_status(&foo_copy).await?;
        info!(
            "Updated Foo {} status: availableReplicas={}",
            foo.name_any(),
            available
        );
        Ok(())
    }

    /// Re-enqueues the Foo owning a changed Deployment.
    pub fn on_deployment_changed(
        &self,
        _key: &ObjectKey,
        deployment: Option<Deployment>,
    ) -> Result<Option<Deployment>, ControllerError> {
        // Deletions arrive through on_deployment_removed
        if let Some(deployment) = deployment {
            self.enqueue_owner(&deployment);
        }
        Ok(None)
    }

    /// Re-enqueues the Foo owning a deleted Deployment.
    pub fn on_deployment_removed(
        &self,
        _key: &ObjectKey,
        deployment: &Deployment,
    ) -> Result<(), ControllerError> {
        self.enqueue_owner(deployment);
        Ok(())
    }

    fn enqueue_owner(&self, deployment: &Deployment) {
        let Some(owner) = controller_of(deployment.meta()) else {
            return;
        };
        match self.owners.route(deployment.namespace().as_deref(), owner) {
            RouteOutcome::Enqueued(key) => {
                debug!("Deployment {} changed, enqueued {} {}", deployment.name_any(), owner.kind, key);
            }
            RouteOutcome::UnknownKind(kind) => {
                debug!("Deployment {} is controlled by a {}, ignoring", deployment.name_any(), kind);
            }
            RouteOutcome::Orphaned(_) => {
                info!(
                    "ignoring orphaned object '{}' of foo '{}'",
                    ObjectKey::from_resource(deployment),
                    owner.name
                );
            }
        }
    }
}

/// Desired Deployment for `foo`: one nginx container, labelled with the
/// Foo's name and controlled by the Foo.
pub fn new_deployment(foo: &Foo) -> Result<Deployment, ControllerError> {
    let owner = controller_owner_ref(foo).ok_or_else(|| {
        ControllerError::Reconciliation(format!("Foo {} has no uid", foo.name_any()))
    })?;
    let labels = BTreeMap::from([
        ("app".to_string(), "nginx".to_string()),
        ("controller".to_string(), foo.name_any()),
    ]);

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(foo.spec.deployment_name.clone()),
            namespace: foo.namespace(),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: foo.spec.replicas,
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "nginx".to_string(),
                        image: Some("nginx:latest".to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

struct FooChanged(Arc<Handler>);

#[async_trait]
impl ChangeHandler<Foo> for FooChanged {
    async fn on_change(&self, key: &ObjectKey, obj: Option<Foo>) -> anyhow::Result<Option<Foo>> {
        Ok(self.0.on_foo_changed(key, obj).await?)
    }
}

struct DeploymentChanged(Arc<Handler>);

#[async_trait]
impl ChangeHandler<Deployment> for DeploymentChanged {
    async fn on_change(
        &self,
        key: &ObjectKey,
        obj: Option<Deployment>,
    ) -> anyhow::Result<Option<Deployment>> {
        Ok(self.0.on_deployment_changed(key, obj)?)
    }
}

struct DeploymentRemoved(Arc<Handler>);

#[async_trait]
impl RemoveHandler<Deployment> for DeploymentRemoved {
    async fn on_remove(&self, key: &ObjectKey, obj: Deployment) -> anyhow::Result<()> {
        Ok(self.0.on_deployment_removed(key, &obj)?)
    }
}

/// Registers the handler on both dispatchers.
pub fn register(
    handler: &Arc<Handler>,
    foos: &mut Dispatcher<Foo>,
    deployments: &mut Dispatcher<Deployment>,
) {
    foos.on_change(HANDLER_NAME, FooChanged(Arc::clone(handler)));
    deployments.on_change(HANDLER_NAME, DeploymentChanged(Arc::clone(handler)));
    deployments.on_remove(HANDLER_NAME, DeploymentRemoved(Arc::clone(handler)));
}

#[cfg(test)]
#[path = "reconciler_test.rs"]
mod reconciler_test;
