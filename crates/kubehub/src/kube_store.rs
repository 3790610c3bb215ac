//! `ResourceStore` backed by the cluster API via dynamic objects.

use acm_core::{CanonicalResource, ReconcileRequest};
use anyhow::Result;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use serde_json::json;
use tracing::debug;

use crate::store::{ResourceStore, StoreError};
use crate::Resolver;

pub struct KubeStore {
    client: Client,
    ar: ApiResource,
    namespaced: bool,
}

impl KubeStore {
    pub fn new(client: Client, ar: ApiResource, namespaced: bool) -> Self {
        Self { client, ar, namespaced }
    }

    /// Build a store for the canonical kind named by `gvk_key`.
    pub fn resolve(client: Client, resolver: &Resolver, gvk_key: &str) -> Result<Self> {
        let gvk = acm_core::parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = resolver.resolve(&gvk)?;
        Ok(Self::new(client, ar, namespaced))
    }

    fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match (self.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &self.ar),
            _ => Api::all_with(self.client.clone(), &self.ar),
        }
    }
}

fn to_resource(obj: DynamicObject) -> Result<CanonicalResource, StoreError> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

fn to_dynamic(res: &CanonicalResource) -> Result<DynamicObject, StoreError> {
    Ok(serde_json::from_value(serde_json::to_value(res)?)?)
}

#[async_trait::async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, key: &ReconcileRequest) -> Result<CanonicalResource, StoreError> {
        match self.api(key.namespace.as_deref()).get_opt(&key.name).await? {
            Some(obj) => to_resource(obj),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn list(&self) -> Result<Vec<CanonicalResource>, StoreError> {
        let list = self.api(None).list(&ListParams::default()).await?;
        list.items.into_iter().map(to_resource).collect()
    }

    async fn update(&self, obj: &CanonicalResource) -> Result<CanonicalResource, StoreError> {
        let mut dynamic = to_dynamic(obj)?;
        // status is owned by the subresource; keep it out of the main write
        if let Some(m) = dynamic.data.as_object_mut() {
            m.remove("status");
        }
        let out = self.api(obj.namespace()).replace(obj.name(), &PostParams::default(), &dynamic).await?;
        debug!(name = obj.name(), ns = ?obj.namespace(), rv = ?out.metadata.resource_version, "updated resource");
        to_resource(out)
    }

    async fn update_status(&self, obj: &CanonicalResource) -> Result<CanonicalResource, StoreError> {
        // resourceVersion in the merge patch makes the write conditional
        let patch = json!({
            "metadata": { "resourceVersion": obj.metadata.resource_version },
            "status": obj.status,
        });
        let out = self
            .api(obj.namespace())
            .patch_status(obj.name(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!(name = obj.name(), ns = ?obj.namespace(), rv = ?out.metadata.resource_version, "updated status");
        to_resource(out)
    }

    async fn delete(&self, key: &ReconcileRequest) -> Result<(), StoreError> {
        self.api(key.namespace.as_deref()).delete(&key.name, &DeleteParams::default()).await?;
        Ok(())
    }
}
