//! Finalizer marker updates against the API server
//!
//! The dispatcher only needs to add and remove finalizer names; everything
//! else about the backing store is owned by the controllers themselves.

use std::marker::PhantomData;

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, Patch, PatchParams},
    Client, Resource, ResourceExt,
};
use serde_json::json;
use tracing::{debug, info};

use super::entity::WatchedResource;
use super::finalizers::{with_finalizers, without_finalizers};
use crate::error::{Error, Result};

#[async_trait]
pub trait ResourceClient<K>: Send + Sync + 'static {
    /// Attach `names` to the object's finalizers and return the updated object
    async fn add_finalizers(&self, obj: &K, names: &[String]) -> Result<K>;

    /// Detach `names`; an object that no longer exists is not an error
    async fn remove_finalizers(&self, obj: &K, names: &[String]) -> Result<()>;
}

/// [`ResourceClient`] backed by a kube [`Client`]
pub struct KubeResourceClient<K> {
    client: Client,
    field_manager: String,
    api_for: fn(Client, Option<&str>) -> Api<K>,
    _resource: PhantomData<fn() -> K>,
}

fn namespaced_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn cluster_api<K>(client: Client, _namespace: Option<&str>) -> Api<K>
where
    K: Resource<DynamicType = ()>,
{
    Api::all(client)
}

impl<K> KubeResourceClient<K>
where
    K: WatchedResource,
{
    /// Client for a namespaced resource type
    pub fn namespaced(client: Client, field_manager: &str) -> Self
    where
        K: Resource<Scope = NamespaceResourceScope>,
    {
        Self::with_api(client, field_manager, namespaced_api::<K>)
    }

    /// Client for a cluster scoped resource type
    pub fn cluster(client: Client, field_manager: &str) -> Self {
        Self::with_api(client, field_manager, cluster_api::<K>)
    }

    fn with_api(
        client: Client,
        field_manager: &str,
        api_for: fn(Client, Option<&str>) -> Api<K>,
    ) -> Self {
        Self {
            client,
            field_manager: field_manager.to_string(),
            api_for,
            _resource: PhantomData,
        }
    }

    fn api(&self, obj: &K) -> Api<K> {
        (self.api_for)(self.client.clone(), obj.namespace().as_deref())
    }

    /// Merge-patch the finalizer list, guarded by the object's resourceVersion
    async fn patch_finalizers(&self, obj: &K, finalizers: Vec<String>) -> Result<K> {
        let name = obj
            .meta()
            .name
            .clone()
            .ok_or(Error::MissingObjectKey("metadata.name"))?;
        let mut metadata = json!({ "finalizers": finalizers });
        if let Some(rv) = obj.resource_version() {
            metadata["resourceVersion"] = json!(rv);
        }
        let patch = json!({ "metadata": metadata });

        let updated = self
            .api(obj)
            .patch(
                &name,
                &PatchParams::apply(&self.field_manager),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(updated)
    }
}

#[async_trait]
impl<K> ResourceClient<K> for KubeResourceClient<K>
where
    K: WatchedResource,
{
    async fn add_finalizers(&self, obj: &K, names: &[String]) -> Result<K> {
        let updated = self
            .patch_finalizers(obj, with_finalizers(obj, names))
            .await?;
        info!(
            "Added finalizers {:?} to {}/{}",
            names,
            obj.namespace().unwrap_or_default(),
            obj.name_any()
        );
        Ok(updated)
    }

    async fn remove_finalizers(&self, obj: &K, names: &[String]) -> Result<()> {
        match self
            .patch_finalizers(obj, without_finalizers(obj, names))
            .await
        {
            Ok(_) => {
                info!(
                    "Removed finalizers {:?} from {}/{}",
                    names,
                    obj.namespace().unwrap_or_default(),
                    obj.name_any()
                );
                Ok(())
            }
            Err(Error::KubeError(kube::Error::Api(e))) if e.code == 404 => {
                debug!("{} already gone, nothing to detach", obj.name_any());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
