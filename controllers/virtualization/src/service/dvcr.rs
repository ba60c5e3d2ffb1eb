//! DVCR maintenance state.
//!
//! Garbage collection of DVCR is requested by creating the
//! `dvcr-maintenance` Secret in the controller namespace. The registry is in
//! maintenance from then on until the Secret is annotated as done or removed.
//! New imports are postponed meanwhile.

use k8s_openapi::api::core::v1::Secret;
use tracing::debug;

use crds::annotations::{ANN_DVCR_GC_DONE, ANN_DVCR_SWITCH_TO_MAINTENANCE, DVCR_MAINTENANCE_SECRET_NAME};

use super::ServiceError;
use crate::meta;
use crate::store::Store;

/// Reads the DVCR maintenance Secret.
#[derive(Debug, Clone)]
pub struct DvcrMaintenanceService {
    store: Store,
    namespace: String,
}

impl DvcrMaintenanceService {
    /// Creates a service reading the Secret from `namespace`.
    pub fn new(store: Store, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    async fn secret(&self) -> Result<Option<Secret>, ServiceError> {
        Ok(self
            .store
            .get(Some(&self.namespace), DVCR_MAINTENANCE_SECRET_NAME)
            .await?)
    }

    /// Returns true while maintenance is requested and not finished.
    pub async fn is_maintenance_active(&self) -> Result<bool, ServiceError> {
        let Some(secret) = self.secret().await? else {
            return Ok(false);
        };
        let active = !meta::is_deleting(&secret) && meta::annotation(&secret, ANN_DVCR_GC_DONE).is_none();
        debug!(active, "DVCR maintenance state");
        Ok(active)
    }

    /// Returns true once the registry Deployment switched to maintenance mode.
    pub async fn is_switched_to_maintenance(&self) -> Result<bool, ServiceError> {
        Ok(self
            .secret()
            .await?
            .is_some_and(|s| meta::annotation(&s, ANN_DVCR_SWITCH_TO_MAINTENANCE).is_some()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_secret, memory_store};

    #[tokio::test]
    async fn test_maintenance_state() {
        let (store, backend) = memory_store();
        let service = DvcrMaintenanceService::new(store, "d8-virtualization");
        assert!(!service.is_maintenance_active().await.unwrap());

        let mut secret = create_test_secret(DVCR_MAINTENANCE_SECRET_NAME, "d8-virtualization");
        backend.seed(&secret);
        assert!(service.is_maintenance_active().await.unwrap());
        assert!(!service.is_switched_to_maintenance().await.unwrap());

        meta::set_annotation(&mut secret, ANN_DVCR_GC_DONE, "");
        backend.seed(&secret);
        assert!(!service.is_maintenance_active().await.unwrap());
    }
}
