//! Resource handle
//!
//! Holds the fetched (`current`) and the working (`changed`) copy of one
//! object. Handlers mutate `changed`; metadata and status are written back
//! separately, each only when it differs from `current`.

use serde_json::Value;
use tracing::debug;

use crate::meta;
use crate::store::{Object, ObjectKey, Store, StoreError};

/// Current and changed views of one object.
#[derive(Debug)]
pub struct Resource<K: Object> {
    key: ObjectKey,
    store: Store,
    current: Option<K>,
    changed: Option<K>,
}

fn without_status<K: Object>(obj: &K) -> Result<Value, StoreError> {
    let mut value = serde_json::to_value(obj)?;
    if let Some(map) = value.as_object_mut() {
        map.remove("status");
        if let Some(meta) = map.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.remove("resourceVersion");
            meta.remove("managedFields");
        }
    }
    Ok(value)
}

impl<K: Object> Resource<K> {
    /// Creates an empty handle for the key.
    pub fn new(key: ObjectKey, store: Store) -> Self {
        Self {
            key,
            store,
            current: None,
            changed: None,
        }
    }

    /// Creates a handle around an already fetched object.
    pub fn from_object(obj: K, store: Store) -> Self {
        Self {
            key: ObjectKey::of(&obj),
            store,
            current: Some(obj.clone()),
            changed: Some(obj),
        }
    }

    /// Loads the object; an absent object leaves the handle empty.
    pub async fn fetch(&mut self) -> Result<(), StoreError> {
        self.current = self.store.get_by_key(&self.key).await?;
        self.changed = self.current.clone();
        Ok(())
    }

    /// Key of the object.
    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// Returns true if the object does not exist.
    pub fn is_empty(&self) -> bool {
        self.current.is_none()
    }

    /// Object as fetched.
    pub fn current(&self) -> Option<&K> {
        self.current.as_ref()
    }

    /// Working copy.
    pub fn changed(&self) -> Option<&K> {
        self.changed.as_ref()
    }

    /// Mutable working copy.
    pub fn changed_mut(&mut self) -> Option<&mut K> {
        self.changed.as_mut()
    }

    /// Writes metadata and spec if they changed.
    pub async fn update_meta(&mut self) -> Result<(), StoreError> {
        let (Some(current), Some(changed)) = (self.current.as_ref(), self.changed.as_mut()) else {
            return Ok(());
        };
        if without_status(current)? == without_status(changed)? {
            return Ok(());
        }

        debug!("Updating metadata of {} {}", K::kind(&()), self.key);
        let updated = self.store.update(&*changed).await?;
        changed.meta_mut().resource_version = updated.meta().resource_version.clone();
        changed.meta_mut().generation = updated.meta().generation;

        self.current = Some(updated);
        Ok(())
    }

    /// Writes the status if it changed.
    pub async fn update_status(&mut self) -> Result<(), StoreError> {
        let (Some(current), Some(changed)) = (self.current.as_ref(), self.changed.as_ref()) else {
            return Ok(());
        };
        let released = meta::is_deleting(changed)
            && changed.meta().finalizers.as_ref().is_none_or(Vec::is_empty);
        if released {
            return Ok(());
        }

        let updated = self.store.update_status(current, changed).await?;
        if let Some(changed) = self.changed.as_mut() {
            changed.meta_mut().resource_version = updated.meta().resource_version.clone();
        }
        self.current = Some(updated);
        Ok(())
    }
}
