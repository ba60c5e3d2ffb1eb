//! Object store
//!
//! Typed CRUD over an untyped backend. The backend deals in JSON values
//! addressed by `ApiResource`, so one implementation serves every kind: the
//! API server in production and an in-memory map in tests.

pub mod cluster;
#[cfg(test)]
pub mod memory;
pub mod patch;

use std::fmt;
use std::sync::Arc;

use ::kube::api::ApiResource;
use ::kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Errors returned by the object store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Object does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Object was modified concurrently
    #[error("conflict updating {0}")]
    Conflict(String),

    /// Object with the same name exists
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Namespace quota rejected the object
    #[error("exceeded quota: {0}")]
    QuotaExceeded(String),

    /// Object has no name
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] ::kube::Error),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Any Kubernetes object the store can read and write.
pub trait Object:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + fmt::Debug + 'static
{
}

impl<T> Object for T where
    T: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + fmt::Debug + 'static
{
}

/// Name and optional namespace of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Name
    pub name: String,
}

impl ObjectKey {
    /// Key of a namespaced object.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of a cluster-scoped object.
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of an existing object.
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.meta().namespace.clone(),
            name: obj.meta().name.clone().unwrap_or_default(),
        }
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

/// Untyped storage operations.
#[async_trait::async_trait]
pub trait StoreBackend: Send + Sync {
    /// Returns the object or `None` when absent.
    async fn get(&self, ar: &ApiResource, namespace: Option<&str>, name: &str) -> Result<Option<Value>, StoreError>;

    /// Lists objects; `None` lists every namespace.
    async fn list(&self, ar: &ApiResource, namespace: Option<&str>) -> Result<Vec<Value>, StoreError>;

    /// Creates the object.
    async fn create(&self, ar: &ApiResource, namespace: Option<&str>, object: Value) -> Result<Value, StoreError>;

    /// Replaces metadata and spec; the status is left untouched.
    async fn replace(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        object: Value,
    ) -> Result<Value, StoreError>;

    /// Applies a JSON merge patch to the status subresource.
    async fn patch_status(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        patch: Value,
    ) -> Result<Value, StoreError>;

    /// Deletes the object; objects with finalizers only get a deletion timestamp.
    async fn delete(&self, ar: &ApiResource, namespace: Option<&str>, name: &str) -> Result<(), StoreError>;
}

/// Typed object store.
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn StoreBackend>,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

fn api_resource<K: Object>() -> ApiResource {
    ApiResource::erase::<K>(&())
}

fn describe<K: Object>(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{} {}/{}", K::kind(&()), ns, name),
        None => format!("{} {}", K::kind(&()), name),
    }
}

impl Store {
    /// Wraps a backend.
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self { backend }
    }

    /// Fetches an object; `Ok(None)` when it does not exist.
    pub async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, StoreError> {
        let value = self.backend.get(&api_resource::<K>(), namespace, name).await?;
        value.map(serde_json::from_value).transpose().map_err(StoreError::from)
    }

    /// Fetches an object by key.
    pub async fn get_by_key<K: Object>(&self, key: &ObjectKey) -> Result<Option<K>, StoreError> {
        self.get(key.namespace.as_deref(), &key.name).await
    }

    /// Lists objects; `None` lists every namespace.
    pub async fn list<K: Object>(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError> {
        self.backend
            .list(&api_resource::<K>(), namespace)
            .await?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(StoreError::from))
            .collect()
    }

    /// Creates an object.
    pub async fn create<K: Object>(&self, obj: &K) -> Result<K, StoreError> {
        let namespace = obj.meta().namespace.clone();
        let created = self
            .backend
            .create(&api_resource::<K>(), namespace.as_deref(), serde_json::to_value(obj)?)
            .await?;
        Ok(serde_json::from_value(created)?)
    }

    /// Writes metadata and spec of an object.
    pub async fn update<K: Object>(&self, obj: &K) -> Result<K, StoreError> {
        let name = obj
            .meta()
            .name
            .clone()
            .ok_or_else(|| StoreError::InvalidObject(format!("{} without name", K::kind(&()))))?;
        let namespace = obj.meta().namespace.clone();
        let updated = self
            .backend
            .replace(&api_resource::<K>(), namespace.as_deref(), &name, serde_json::to_value(obj)?)
            .await?;
        Ok(serde_json::from_value(updated)?)
    }

    /// Writes the status of `changed`, sending only what differs from `current`.
    pub async fn update_status<K: Object>(&self, current: &K, changed: &K) -> Result<K, StoreError> {
        let status_of = |obj: &K| -> Result<Value, StoreError> {
            Ok(serde_json::to_value(obj)?.get("status").cloned().unwrap_or(Value::Null))
        };
        let Some(diff) = patch::diff(&status_of(current)?, &status_of(changed)?) else {
            return Ok(changed.clone());
        };

        let name = changed.meta().name.clone().unwrap_or_default();
        let namespace = changed.meta().namespace.clone();
        let patched = self
            .backend
            .patch_status(&api_resource::<K>(), namespace.as_deref(), &name, json!({ "status": diff }))
            .await?;
        Ok(serde_json::from_value(patched)?)
    }

    /// Deletes an object; a missing object is not an error.
    pub async fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<(), StoreError> {
        match self.backend.delete(&api_resource::<K>(), namespace, name).await {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Deletes an existing object.
    pub async fn delete_object<K: Object>(&self, obj: &K) -> Result<(), StoreError> {
        let key = ObjectKey::of(obj);
        self.delete::<K>(key.namespace.as_deref(), &key.name).await
    }

    /// Returns a `NotFound` error describing the object.
    pub fn not_found<K: Object>(namespace: Option<&str>, name: &str) -> StoreError {
        StoreError::NotFound(describe::<K>(namespace, name))
    }
}
