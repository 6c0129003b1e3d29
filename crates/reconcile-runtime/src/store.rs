//! Authoritative store access.
//!
//! Reconcilers read from the [`Cache`](crate::cache::Cache) and write through
//! an [`ObjectStore`]. The trait keeps the reconcilers testable without a
//! cluster; [`KubeStore`] is the implementation backed by the API server.

use crate::error::StoreError;
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt::Debug;
use std::marker::PhantomData;
use tracing::debug;

/// Typed write access to one namespaced kind.
///
/// The namespace of `create`, `update` and `update_status` is taken from the
/// object's metadata.
#[async_trait]
pub trait ObjectStore<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// Reads the object straight from the store.
    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError>;

    /// Creates `obj`. Fails with `Conflict` when the name is taken.
    async fn create(&self, obj: &K) -> Result<K, StoreError>;

    /// Replaces the spec of `obj`. Without a resource version the write is
    /// unconditional; with one, a stale version fails with `Conflict`.
    async fn update(&self, obj: &K) -> Result<K, StoreError>;

    /// Writes only the status of `obj`, guarded by its resource version.
    async fn update_status(&self, obj: &K) -> Result<K, StoreError>;
}

/// Status merge patch for `obj`: its `status` plus the resource version it
/// was read at, so a stale write is rejected.
pub fn status_patch<K: Resource + Serialize>(obj: &K) -> Result<Value, StoreError> {
    let status = serde_json::to_value(obj)?
        .get("status")
        .cloned()
        .unwrap_or(Value::Null);
    Ok(json!({
        "metadata": { "resourceVersion": obj.meta().resource_version },
        "status": status,
    }))
}

fn object_name<K: Resource>(obj: &K) -> Result<(String, String), StoreError> {
    let meta = obj.meta();
    let name = meta
        .name
        .clone()
        .ok_or_else(|| StoreError::Transient("object has no name".to_string()))?;
    Ok((meta.namespace.clone().unwrap_or_default(), name))
}

/// [`ObjectStore`] over the Kubernetes API.
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for KubeStore<K> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K> std::fmt::Debug for KubeStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl<K> KubeStore<K> {
    /// Store writing through `client`.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
    K::DynamicType: Default,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K, StoreError> {
        Ok(self.api(namespace).get(name).await?)
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = object_name(obj)?;
        debug!("Creating {}/{}", namespace, name);
        Ok(self
            .api(&namespace)
            .create(&PostParams::default(), obj)
            .await?)
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = object_name(obj)?;
        debug!("Updating {}/{}", namespace, name);
        Ok(self
            .api(&namespace)
            .replace(&name, &PostParams::default(), obj)
            .await?)
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = object_name(obj)?;
        let patch = status_patch(obj)?;
        debug!("Updating status of {}/{}", namespace, name);
        Ok(self
            .api(&namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }
}
