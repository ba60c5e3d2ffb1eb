//! Object store backed by the API server.

use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::Value;

use super::{StoreBackend, StoreError};

/// Store backend talking to the API server.
#[derive(Clone)]
pub struct ClusterStore {
    client: Client,
}

impl std::fmt::Debug for ClusterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterStore").finish_non_exhaustive()
    }
}

impl ClusterStore {
    /// Creates a backend from a Kubernetes client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, ar: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }
}

/// Maps API status codes onto store errors.
fn map_error(err: kube::Error, what: String) -> StoreError {
    match &err {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound(what),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => StoreError::AlreadyExists(what),
        kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict(what),
        kube::Error::Api(ae) if ae.code == 403 && ae.message.contains("exceeded quota") => {
            StoreError::QuotaExceeded(ae.message.clone())
        }
        _ => StoreError::Kube(err),
    }
}

fn describe(ar: &ApiResource, namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{} {}/{}", ar.kind, ns, name),
        None => format!("{} {}", ar.kind, name),
    }
}

#[async_trait::async_trait]
impl StoreBackend for ClusterStore {
    async fn get(&self, ar: &ApiResource, namespace: Option<&str>, name: &str) -> Result<Option<Value>, StoreError> {
        let obj = self
            .api(ar, namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_error(e, describe(ar, namespace, name)))?;
        obj.map(serde_json::to_value).transpose().map_err(StoreError::from)
    }

    async fn list(&self, ar: &ApiResource, namespace: Option<&str>) -> Result<Vec<Value>, StoreError> {
        let list = self
            .api(ar, namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| map_error(e, ar.kind.clone()))?;
        list.items
            .into_iter()
            .map(|o| serde_json::to_value(o).map_err(StoreError::from))
            .collect()
    }

    async fn create(&self, ar: &ApiResource, namespace: Option<&str>, object: Value) -> Result<Value, StoreError> {
        let obj: DynamicObject = serde_json::from_value(object)?;
        let name = obj.metadata.name.clone().unwrap_or_default();
        let created = self
            .api(ar, namespace)
            .create(&PostParams::default(), &obj)
            .await
            .map_err(|e| map_error(e, describe(ar, namespace, &name)))?;
        Ok(serde_json::to_value(created)?)
    }

    async fn replace(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        object: Value,
    ) -> Result<Value, StoreError> {
        let obj: DynamicObject = serde_json::from_value(object)?;
        let replaced = self
            .api(ar, namespace)
            .replace(name, &PostParams::default(), &obj)
            .await
            .map_err(|e| map_error(e, describe(ar, namespace, name)))?;
        Ok(serde_json::to_value(replaced)?)
    }

    async fn patch_status(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        patch: Value,
    ) -> Result<Value, StoreError> {
        let patched = self
            .api(ar, namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_error(e, describe(ar, namespace, name)))?;
        Ok(serde_json::to_value(patched)?)
    }

    async fn delete(&self, ar: &ApiResource, namespace: Option<&str>, name: &str) -> Result<(), StoreError> {
        self.api(ar, namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| map_error(e, describe(ar, namespace, name)))?;
        Ok(())
    }
}
