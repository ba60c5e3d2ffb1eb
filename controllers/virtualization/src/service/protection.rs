//! Finalizer-based protection of supplementary objects.

use tracing::debug;

use crate::meta;
use crate::store::{Object, Store, StoreError};

/// Adds and removes one protection finalizer.
#[derive(Debug, Clone)]
pub struct ProtectionService {
    store: Store,
    finalizer: &'static str,
}

impl ProtectionService {
    /// Creates a service for the finalizer.
    pub fn new(store: Store, finalizer: &'static str) -> Self {
        Self { store, finalizer }
    }

    /// Adds the finalizer unless the object is already protected or being deleted.
    pub async fn protect<K: Object>(&self, obj: &K) -> Result<(), StoreError> {
        if meta::is_deleting(obj) || meta::has_finalizer(obj, self.finalizer) {
            return Ok(());
        }
        let mut protected = obj.clone();
        meta::add_finalizer(&mut protected, self.finalizer);
        debug!("Protecting {} {}", K::kind(&()), protected.meta().name.as_deref().unwrap_or_default());
        self.store.update(&protected).await?;
        Ok(())
    }

    /// Removes the finalizer.
    pub async fn unprotect<K: Object>(&self, obj: &K) -> Result<(), StoreError> {
        let mut released = obj.clone();
        if !meta::remove_finalizer(&mut released, self.finalizer) {
            return Ok(());
        }
        debug!("Unprotecting {} {}", K::kind(&()), released.meta().name.as_deref().unwrap_or_default());
        match self.store.update(&released).await {
            Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Protects the object when present.
    pub async fn protect_opt<K: Object>(&self, obj: Option<&K>) -> Result<(), StoreError> {
        match obj {
            Some(obj) => self.protect(obj).await,
            None => Ok(()),
        }
    }

    /// Unprotects the object when present.
    pub async fn unprotect_opt<K: Object>(&self, obj: Option<&K>) -> Result<(), StoreError> {
        match obj {
            Some(obj) => self.unprotect(obj).await,
            None => Ok(()),
        }
    }
}
