//! Owner references and owner routing.
//!
//! A dependent object names its controller through the single owner
//! reference flagged `controller: true`. When a dependent changes, the
//! owner's key is pushed back into the owner kind's work queue through an
//! explicit routing table keyed by owner kind.

use crate::dispatcher::KindHandle;
use crate::key::{ObjectKey, OwnerKey};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Returns the controller owner reference, if any.
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

/// True when `dependent`'s controller reference carries `owner`'s uid.
pub fn is_controlled_by<D: Resource, O: Resource>(dependent: &D, owner: &O) -> bool {
    match (controller_of(dependent.meta()), owner.meta().uid.as_deref()) {
        (Some(reference), Some(uid)) => reference.uid == uid,
        _ => false,
    }
}

/// Controller owner reference pointing at `owner`, with
/// `blockOwnerDeletion` set. `None` when `owner` has no name or uid yet.
pub fn controller_owner_ref<K: Resource<DynamicType = ()>>(owner: &K) -> Option<OwnerReference> {
    let mut reference = owner.controller_owner_ref(&())?;
    reference.controller = Some(true);
    reference.block_owner_deletion = Some(true);
    Some(reference)
}

/// Owner index entry for a dependent, derived from its controller reference.
pub(crate) fn controller_key<K: Resource>(obj: &K) -> Option<OwnerKey> {
    let reference = controller_of(obj.meta())?;
    let namespace = obj.meta().namespace.clone();
    Some(OwnerKey::new(
        reference.kind.clone(),
        ObjectKey {
            namespace,
            name: reference.name.clone(),
        },
    ))
}

/// API group part of an `apiVersion` (`""` for the core group).
pub(crate) fn group_of(api_version: &str) -> &str {
    api_version
        .split_once('/')
        .map_or("", |(group, _version)| group)
}

/// Result of routing a controller reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Owner found in its cache and its key enqueued
    Enqueued(ObjectKey),
    /// No route registered for the reference's kind/group
    UnknownKind(String),
    /// Route exists but the owner is not in the cache
    Orphaned(ObjectKey),
}

/// A destination for owner re-enqueues.
pub trait OwnerRoute: Send + Sync {
    /// API group the route accepts.
    fn group(&self) -> &str;
    /// True when the owner is present in the cache.
    fn resolve(&self, key: &ObjectKey) -> bool;
    /// Enqueue the owner for reconciliation.
    fn enqueue(&self, key: ObjectKey);
}

impl<K> OwnerRoute for KindHandle<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn group(&self) -> &str {
        KindHandle::group(self)
    }

    fn resolve(&self, key: &ObjectKey) -> bool {
        self.cache().contains(key)
    }

    fn enqueue(&self, key: ObjectKey) {
        KindHandle::enqueue_key(self, key);
    }
}

/// Lookup table from owner kind to the route that re-enqueues it.
#[derive(Clone, Default)]
pub struct OwnerRoutes {
    routes: HashMap<String, Arc<dyn OwnerRoute>>,
}

impl std::fmt::Debug for OwnerRoutes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&String> = self.routes.keys().collect();
        kinds.sort();
        f.debug_struct("OwnerRoutes").field("kinds", &kinds).finish()
    }
}

impl OwnerRoutes {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route owners of `handle`'s kind back into its queue.
    pub fn register<K>(&mut self, handle: KindHandle<K>)
    where
        K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    {
        info!("Registering owner route for {}", handle.kind());
        self.routes
            .insert(handle.kind().to_string(), Arc::new(handle));
    }

    /// Route for `kind`, if registered.
    pub fn get(&self, kind: &str) -> Option<&Arc<dyn OwnerRoute>> {
        self.routes.get(kind)
    }

    /// Resolve a controller reference found on an object in `namespace` and
    /// enqueue the owner when it is known.
    pub fn route(&self, namespace: Option<&str>, reference: &OwnerReference) -> RouteOutcome {
        let Some(route) = self
            .routes
            .get(&reference.kind)
            .filter(|r| r.group() == group_of(&reference.api_version))
        else {
            debug!(
                "No owner route for {} ({})",
                reference.kind, reference.api_version
            );
            return RouteOutcome::UnknownKind(reference.kind.clone());
        };

        let key = ObjectKey {
            namespace: namespace.map(str::to_string),
            name: reference.name.clone(),
        };
        if !route.resolve(&key) {
            return RouteOutcome::Orphaned(key);
        }
        route.enqueue(key.clone());
        RouteOutcome::Enqueued(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner_ref(kind: &str, name: &str, uid: &str, controller: Option<bool>) -> OwnerReference {
        OwnerReference {
            api_version: "samplecontroller.k8s.io/v1alpha1".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
            controller,
            block_owner_deletion: None,
        }
    }

    #[test]
    fn test_controller_of_picks_controller_reference() {
        let meta = ObjectMeta {
            owner_references: Some(vec![
                owner_ref("Foo", "plain-owner", "uid-1", None),
                owner_ref("Foo", "the-controller", "uid-2", Some(true)),
            ]),
            ..Default::default()
        };
        let reference = controller_of(&meta).unwrap();
        assert_eq!(reference.name, "the-controller");
    }

    #[test]
    fn test_controller_of_none_without_controller_flag() {
        let meta = ObjectMeta {
            owner_references: Some(vec![owner_ref("Foo", "x", "uid-1", Some(false))]),
            ..Default::default()
        };
        assert!(controller_of(&meta).is_none());
        assert!(controller_of(&ObjectMeta::default()).is_none());
    }

    #[test]
    fn test_group_of() {
        assert_eq!(group_of("samplecontroller.k8s.io/v1alpha1"), "samplecontroller.k8s.io");
        assert_eq!(group_of("v1"), "");
        assert_eq!(group_of("apps/v1"), "apps");
    }

    #[test]
    fn test_controller_owner_ref_points_at_owner() {
        use k8s_openapi::api::apps::v1::Deployment;

        let owner = Deployment {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                uid: Some("uid-web".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let reference = controller_owner_ref(&owner).unwrap();
        assert_eq!(reference.kind, "Deployment");
        assert_eq!(reference.api_version, "apps/v1");
        assert_eq!(reference.uid, "uid-web");
        assert_eq!(reference.controller, Some(true));
        assert_eq!(reference.block_owner_deletion, Some(true));

        assert!(controller_owner_ref(&Deployment::default()).is_none());
    }

    #[tokio::test]
    async fn test_route_resolves_through_registered_kind() {
        use crate::cache::{Cache, CacheEvent};
        use crate::dispatcher::Dispatcher;
        use crate::mock::RecordingErrorSink;
        use crate::queue::{QueueConfig, WorkQueue};
        use k8s_openapi::api::apps::v1::Deployment;

        let dispatcher: Dispatcher<Deployment> = Dispatcher::new(
            "Deployment",
            Cache::new(),
            WorkQueue::new("Deployment", QueueConfig::default()),
            Arc::new(RecordingErrorSink::new()),
        );
        let handle = dispatcher.handle();
        handle.cache().apply(CacheEvent::Applied(Deployment {
            metadata: ObjectMeta {
                name: Some("owner".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }));

        let mut routes = OwnerRoutes::new();
        routes.register(handle.clone());

        let mut reference = owner_ref("Deployment", "owner", "uid-1", Some(true));
        reference.api_version = "apps/v1".to_string();
        assert_eq!(
            routes.route(Some("default"), &reference),
            RouteOutcome::Enqueued(ObjectKey::new("default", "owner"))
        );
        assert_eq!(handle.queue().len(), 1);

        reference.name = "missing".to_string();
        assert_eq!(
            routes.route(Some("default"), &reference),
            RouteOutcome::Orphaned(ObjectKey::new("default", "missing"))
        );

        // Same kind name, different group
        reference.api_version = "example.com/v1".to_string();
        assert_eq!(
            routes.route(Some("default"), &reference),
            RouteOutcome::UnknownKind("Deployment".to_string())
        );
        assert_eq!(
            routes.route(Some("default"), &owner_ref("Foo", "x", "uid", Some(true))),
            RouteOutcome::UnknownKind("Foo".to_string())
        );
        assert_eq!(handle.queue().len(), 1);
    }
}
