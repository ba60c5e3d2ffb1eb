//! In-memory object store for unit tests
//!
//! Mimics the API server closely enough for reconcilers: uids, resource
//! versions with conflict detection, generations bumped on spec changes,
//! finalizer-aware deletion and a separate status subresource.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use kube::api::ApiResource;
use serde::Serialize;
use serde_json::{json, Value};

use super::patch;
use super::{StoreBackend, StoreError};

type Key = (String, String, String);

/// In-memory store backend
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    objects: Arc<Mutex<HashMap<Key, Value>>>,
    revision: Arc<Mutex<u64>>,
    exhausted: Arc<Mutex<HashSet<String>>>,
}

fn key(ar: &ApiResource, namespace: Option<&str>, name: &str) -> Key {
    (
        format!("{}/{}", ar.api_version, ar.kind),
        namespace.unwrap_or_default().to_string(),
        name.to_string(),
    )
}

fn key_of(value: &Value) -> Key {
    let text = |v: &Value| v.as_str().unwrap_or_default().to_string();
    (
        format!("{}/{}", text(&value["apiVersion"]), text(&value["kind"])),
        text(&value["metadata"]["namespace"]),
        text(&value["metadata"]["name"]),
    )
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn has_finalizers(value: &Value) -> bool {
    value["metadata"]["finalizers"].as_array().is_some_and(|f| !f.is_empty())
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_revision(&self) -> String {
        let mut revision = self.revision.lock().unwrap();
        *revision += 1;
        revision.to_string()
    }

    /// Inserts an object as is, filling in uid, generation and resource version when missing.
    pub fn seed<K: Serialize>(&self, obj: &K) {
        let mut value = serde_json::to_value(obj).unwrap();
        let meta = &mut value["metadata"];
        if meta["uid"].is_null() {
            meta["uid"] = json!(uuid::Uuid::new_v4().to_string());
        }
        if meta["generation"].is_null() {
            meta["generation"] = json!(1);
        }
        if meta["creationTimestamp"].is_null() {
            meta["creationTimestamp"] = json!(now());
        }
        meta["resourceVersion"] = json!(self.next_revision());
        self.objects.lock().unwrap().insert(key_of(&value), value);
    }

    /// Rejects every further create of `kind` as the API server does when a
    /// ResourceQuota is exhausted.
    pub fn exceed_quota(&self, kind: &str) {
        self.exhausted.lock().unwrap().insert(kind.to_string());
    }

    /// Number of stored objects of a kind.
    pub fn count(&self, kind: &str) -> usize {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(k, _, _)| k.rsplit('/').next() == Some(kind))
            .count()
    }
}

#[async_trait::async_trait]
impl StoreBackend for MemoryStore {
    async fn get(&self, ar: &ApiResource, namespace: Option<&str>, name: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.objects.lock().unwrap().get(&key(ar, namespace, name)).cloned())
    }

    async fn list(&self, ar: &ApiResource, namespace: Option<&str>) -> Result<Vec<Value>, StoreError> {
        let kind = format!("{}/{}", ar.api_version, ar.kind);
        let objects = self.objects.lock().unwrap();
        let mut items: Vec<(Key, Value)> = objects
            .iter()
            .filter(|(k, _)| k.0 == kind && namespace.is_none_or(|n| n == k.1))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(items.into_iter().map(|(_, v)| v).collect())
    }

    async fn create(&self, ar: &ApiResource, namespace: Option<&str>, mut object: Value) -> Result<Value, StoreError> {
        let name = object["metadata"]["name"].as_str().unwrap_or_default().to_string();
        let k = key(ar, namespace, &name);
        if self.objects.lock().unwrap().contains_key(&k) {
            return Err(StoreError::AlreadyExists(format!("{} {}", ar.kind, name)));
        }
        if self.exhausted.lock().unwrap().contains(&ar.kind) {
            return Err(StoreError::QuotaExceeded(format!("{} {}", ar.kind, name)));
        }

        object["apiVersion"] = json!(ar.api_version);
        object["kind"] = json!(ar.kind);
        let meta = &mut object["metadata"];
        meta["uid"] = json!(uuid::Uuid::new_v4().to_string());
        meta["generation"] = json!(1);
        meta["creationTimestamp"] = json!(now());
        meta["resourceVersion"] = json!(self.next_revision());

        self.objects.lock().unwrap().insert(k, object.clone());
        Ok(object)
    }

    async fn replace(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        mut object: Value,
    ) -> Result<Value, StoreError> {
        let k = key(ar, namespace, name);
        let revision = self.next_revision();
        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .get(&k)
            .ok_or_else(|| StoreError::NotFound(format!("{} {}", ar.kind, name)))?;

        let incoming_rv = object["metadata"]["resourceVersion"].as_str().unwrap_or_default();
        if !incoming_rv.is_empty() && stored["metadata"]["resourceVersion"].as_str() != Some(incoming_rv) {
            return Err(StoreError::Conflict(format!("{} {}", ar.kind, name)));
        }

        let spec_changed = object.get("spec") != stored.get("spec");
        let generation = stored["metadata"]["generation"].as_i64().unwrap_or(1);

        match stored.get("status") {
            Some(status) => object["status"] = status.clone(),
            None => {
                if let Some(obj) = object.as_object_mut() {
                    obj.remove("status");
                }
            }
        }
        for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
            object["metadata"][field] = stored["metadata"][field].clone();
        }
        if object["metadata"]["deletionTimestamp"].is_null() {
            if let Some(meta) = object["metadata"].as_object_mut() {
                meta.remove("deletionTimestamp");
            }
        }
        object["metadata"]["generation"] = json!(if spec_changed { generation + 1 } else { generation });
        object["metadata"]["resourceVersion"] = json!(revision);

        if !stored["metadata"]["deletionTimestamp"].is_null() && !has_finalizers(&object) {
            objects.remove(&k);
        } else {
            objects.insert(k, object.clone());
        }
        Ok(object)
    }

    async fn patch_status(
        &self,
        ar: &ApiResource,
        namespace: Option<&str>,
        name: &str,
        status_patch: Value,
    ) -> Result<Value, StoreError> {
        let revision = self.next_revision();
        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .get_mut(&key(ar, namespace, name))
            .ok_or_else(|| StoreError::NotFound(format!("{} {}", ar.kind, name)))?;

        patch::apply(stored, &status_patch);
        stored["metadata"]["resourceVersion"] = json!(revision);
        Ok(stored.clone())
    }

    async fn delete(&self, ar: &ApiResource, namespace: Option<&str>, name: &str) -> Result<(), StoreError> {
        let k = key(ar, namespace, name);
        let revision = self.next_revision();
        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .get_mut(&k)
            .ok_or_else(|| StoreError::NotFound(format!("{} {}", ar.kind, name)))?;

        if has_finalizers(stored) {
            if stored["metadata"]["deletionTimestamp"].is_null() {
                stored["metadata"]["deletionTimestamp"] = json!(now());
                stored["metadata"]["resourceVersion"] = json!(revision);
            }
        } else {
            objects.remove(&k);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::test_utils::create_test_cvi;
    use crds::ClusterVirtualImage;

    #[tokio::test]
    async fn test_create_assigns_uid_and_generation() {
        let store = Store::new(Arc::new(MemoryStore::new()));

        let created = store.create(&create_test_cvi("ubuntu")).await.unwrap();

        assert!(created.metadata.uid.is_some());
        assert_eq!(created.metadata.generation, Some(1));
        assert!(store.create(&create_test_cvi("ubuntu")).await.is_err());
    }

    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = Store::new(Arc::new(MemoryStore::new()));
        let created = store.create(&create_test_cvi("ubuntu")).await.unwrap();

        let mut first = created.clone();
        first.spec.data_source.http.as_mut().unwrap().url = "https://example.com/b.iso".to_string();
        let updated = store.update(&first).await.unwrap();
        assert_eq!(updated.metadata.generation, Some(2));

        let result = store.update(&created).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_delete_waits_for_finalizers() {
        let store = Store::new(Arc::new(MemoryStore::new()));
        let mut cvi = create_test_cvi("ubuntu");
        cvi.metadata.finalizers = Some(vec!["test/finalizer".to_string()]);
        store.create(&cvi).await.unwrap();

        store.delete::<ClusterVirtualImage>(None, "ubuntu").await.unwrap();
        let mut deleting: ClusterVirtualImage = store.get(None, "ubuntu").await.unwrap().unwrap();
        assert!(deleting.metadata.deletion_timestamp.is_some());

        deleting.metadata.finalizers = Some(Vec::new());
        store.update(&deleting).await.unwrap();
        assert!(store.get::<ClusterVirtualImage>(None, "ubuntu").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_status_writes_only_status() {
        let store = Store::new(Arc::new(MemoryStore::new()));
        let created = store.create(&create_test_cvi("ubuntu")).await.unwrap();

        let mut changed = created.clone();
        changed.status.get_or_insert_with(Default::default).progress = "10%".to_string();
        changed.spec.data_source.http = None;
        store.update_status(&created, &changed).await.unwrap();

        let stored: ClusterVirtualImage = store.get(None, "ubuntu").await.unwrap().unwrap();
        assert_eq!(stored.status.unwrap().progress, "10%");
        assert!(stored.spec.data_source.http.is_some());
    }
}
