//! DataVolumes and PVCs
//!
//! A VirtualDisk, or a VirtualImage stored on a PVC, is filled by a CDI
//! DataVolume whose PVC carries the same name. The DataVolume reads either
//! the DVCR image written by the importer or another PVC.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, TypedLocalObjectReference, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use tracing::{debug, info};

use crds::annotations::{
    ANN_ACCESS_MODES, ANN_ACCESS_MODES_DEPRECATED, ANN_STORAGE_CLASS_NAME, ANN_STORAGE_CLASS_NAME_DEPRECATED,
    ANN_VOLUME_MODE, ANN_VOLUME_MODE_DEPRECATED, FINALIZER_PVC_PROTECTION, first_annotation,
};
use crds::cdi::{
    DataVolume, DataVolumePvcSpec, DataVolumeResources, DataVolumeSource, DataVolumeSourcePvc,
    DataVolumeSourceRegistry, DataVolumeSpec,
};
use crds::volume_snapshot::VolumeSnapshot;
use dvcr_client::DvcrSettings;

use super::ServiceError;
use super::importer::{create_if_missing, ensure_dvcr_auth};
use super::protection::ProtectionService;
use super::supplements::Supplements;
use crate::store::{ObjectKey, Store};

const DEFAULT_ACCESS_MODE: &str = "ReadWriteOnce";
const STORAGE: &str = "storage";
const DV_WAIT_FOR_FIRST_CONSUMER: &str = "WaitForFirstConsumer";
const PVC_BOUND: &str = "Bound";
const PVC_LOST: &str = "Lost";

/// Where a DataVolume reads its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskOrigin {
    /// Image in DVCR
    Dvcr {
        /// Full image name
        image: String,
    },
    /// Clone of another PVC
    Pvc(ObjectKey),
}

/// Size and placement of the PVC.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskSettings {
    /// Requested size, e.g. `10Gi`
    pub size: Option<String>,
    /// Storage class, `None` for the cluster default
    pub storage_class: Option<String>,
}

/// Creates DataVolumes and tracks their PVCs.
#[derive(Debug, Clone)]
pub struct DiskService {
    store: Store,
    dvcr: Arc<DvcrSettings>,
    protection: ProtectionService,
}

impl DiskService {
    /// Creates a disk service.
    pub fn new(store: Store, dvcr: Arc<DvcrSettings>) -> Self {
        Self {
            protection: ProtectionService::new(store.clone(), FINALIZER_PVC_PROTECTION),
            store,
            dvcr,
        }
    }

    /// Creates the DataVolume filling the PVC named like it.
    pub async fn start(
        &self,
        origin: &DiskOrigin,
        settings: &DiskSettings,
        sup: &Supplements,
        owner: OwnerReference,
    ) -> Result<(), ServiceError> {
        let source = match origin {
            DiskOrigin::Dvcr { image } => {
                let has_auth = ensure_dvcr_auth(&self.store, &self.dvcr, sup).await?;
                DataVolumeSource {
                    registry: Some(DataVolumeSourceRegistry {
                        url: format!("docker://{image}"),
                        secret_ref: has_auth.then(|| sup.dvcr_auth_secret().name),
                        cert_config_map: None,
                    }),
                    pvc: None,
                }
            }
            DiskOrigin::Pvc(key) => DataVolumeSource {
                registry: None,
                pvc: Some(DataVolumeSourcePvc {
                    namespace: key.namespace.clone().unwrap_or_default(),
                    name: key.name.clone(),
                }),
            },
        };

        let key = sup.data_volume();
        let mut requests = BTreeMap::new();
        if let Some(size) = &settings.size {
            requests.insert(STORAGE.to_string(), size.clone());
        }
        let dv = DataVolume {
            metadata: ObjectMeta {
                name: Some(key.name.clone()),
                namespace: key.namespace.clone(),
                owner_references: Some(vec![owner]),
                ..Default::default()
            },
            spec: DataVolumeSpec {
                source,
                pvc: DataVolumePvcSpec {
                    access_modes: vec![DEFAULT_ACCESS_MODE.to_string()],
                    resources: DataVolumeResources { requests },
                    storage_class_name: settings.storage_class.clone(),
                    volume_mode: None,
                },
            },
            status: None,
        };

        info!("Creating DataVolume {}", key);
        create_if_missing(&self.store, &dv).await?;
        Ok(())
    }

    /// Returns the DataVolume.
    pub async fn get_data_volume(&self, sup: &Supplements) -> Result<Option<DataVolume>, ServiceError> {
        Ok(self.store.get_by_key(&sup.data_volume()).await?)
    }

    /// Returns the PVC filled by the DataVolume.
    pub async fn get_pvc(&self, sup: &Supplements) -> Result<Option<PersistentVolumeClaim>, ServiceError> {
        Ok(self.store.get_by_key(&sup.data_volume()).await?)
    }

    /// Returns a PVC by key.
    pub async fn get_pvc_by_key(&self, key: &ObjectKey) -> Result<Option<PersistentVolumeClaim>, ServiceError> {
        Ok(self.store.get_by_key(key).await?)
    }

    /// Keeps the DataVolume and the PVC from being deleted.
    pub async fn protect(
        &self,
        dv: Option<&DataVolume>,
        pvc: Option<&PersistentVolumeClaim>,
    ) -> Result<(), ServiceError> {
        self.protection.protect_opt(dv).await?;
        self.protection.protect_opt(pvc).await?;
        Ok(())
    }

    /// Releases the DataVolume and the PVC.
    pub async fn unprotect(
        &self,
        dv: Option<&DataVolume>,
        pvc: Option<&PersistentVolumeClaim>,
    ) -> Result<(), ServiceError> {
        self.protection.unprotect_opt(dv).await?;
        self.protection.unprotect_opt(pvc).await?;
        Ok(())
    }

    /// Deletes the DataVolume, its PVC and a restored PVC; returns true if anything existed.
    pub async fn clean_up(&self, sup: &Supplements) -> Result<bool, ServiceError> {
        let mut found = false;
        if let Some(dv) = self.get_data_volume(sup).await? {
            self.protection.unprotect(&dv).await?;
            self.store.delete_object(&dv).await?;
            found = true;
        }
        for key in [sup.data_volume(), sup.restored_pvc()] {
            if let Some(pvc) = self.get_pvc_by_key(&key).await? {
                debug!("Deleting PVC {}", key);
                self.protection.unprotect(&pvc).await?;
                self.store.delete_object(&pvc).await?;
                found = true;
            }
        }
        Ok(found)
    }

    /// Creates a PVC restored from a VolumeSnapshot; settings are taken from
    /// the snapshot annotations, falling back to the deprecated names.
    pub async fn restore_pvc_from_snapshot(
        &self,
        snapshot: &VolumeSnapshot,
        sup: &Supplements,
        owner: OwnerReference,
    ) -> Result<PersistentVolumeClaim, ServiceError> {
        let annotations = snapshot.metadata.annotations.as_ref();
        let storage_class = first_annotation(annotations, &[ANN_STORAGE_CLASS_NAME, ANN_STORAGE_CLASS_NAME_DEPRECATED]);
        let volume_mode = first_annotation(annotations, &[ANN_VOLUME_MODE, ANN_VOLUME_MODE_DEPRECATED]);
        let access_modes = first_annotation(annotations, &[ANN_ACCESS_MODES, ANN_ACCESS_MODES_DEPRECATED])
            .map(|modes| modes.split(',').map(|m| m.trim().to_string()).collect())
            .unwrap_or_else(|| vec![DEFAULT_ACCESS_MODE.to_string()]);
        let restore_size = snapshot
            .status
            .as_ref()
            .and_then(|s| s.restore_size.clone())
            .ok_or_else(|| {
                ServiceError::MissingField(format!(
                    "restore size of VolumeSnapshot {}",
                    ObjectKey::of(snapshot)
                ))
            })?;

        let key = sup.restored_pvc();
        let pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(key.name.clone()),
                namespace: key.namespace.clone(),
                owner_references: Some(vec![owner]),
                finalizers: Some(vec![FINALIZER_PVC_PROTECTION.to_string()]),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(access_modes),
                storage_class_name: storage_class.map(str::to_string),
                volume_mode: volume_mode.map(str::to_string),
                data_source: Some(TypedLocalObjectReference {
                    api_group: Some("snapshot.storage.k8s.io".to_string()),
                    kind: "VolumeSnapshot".to_string(),
                    name: snapshot.metadata.name.clone().unwrap_or_default(),
                }),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(STORAGE.to_string(), Quantity(restore_size))])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        };

        info!("Restoring PVC {} from VolumeSnapshot {}", key, ObjectKey::of(snapshot));
        create_if_missing(&self.store, &pvc).await?;
        Ok(self.store.get_by_key(&key).await?.unwrap_or(pvc))
    }
}

fn pvc_phase(pvc: &PersistentVolumeClaim) -> &str {
    pvc.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or_default()
}

/// Returns true once the PVC is bound to a volume.
pub fn is_pvc_bound(pvc: &PersistentVolumeClaim) -> bool {
    pvc_phase(pvc) == PVC_BOUND
}

/// Returns true when the PVC lost its volume.
pub fn is_pvc_lost(pvc: &PersistentVolumeClaim) -> bool {
    pvc_phase(pvc) == PVC_LOST
}

/// Returns true while the DataVolume waits for a Pod to use its PVC.
pub fn is_wait_for_first_consumer(dv: &DataVolume) -> bool {
    dv.status.as_ref().is_some_and(|s| s.phase == DV_WAIT_FOR_FIRST_CONSUMER)
}

/// Capacity reported by a bound PVC.
pub fn get_capacity(pvc: &PersistentVolumeClaim) -> Option<String> {
    pvc.status
        .as_ref()?
        .capacity
        .as_ref()?
        .get(STORAGE)
        .map(|q| q.0.clone())
}

/// DataVolume progress as a percentage, `None` while unknown.
pub fn get_data_volume_progress(dv: &DataVolume) -> Option<f64> {
    let progress = dv.status.as_ref()?.progress.trim().trim_end_matches('%');
    progress.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_pvc_owner, memory_store};
    use crds::volume_snapshot::{VolumeSnapshotSpec, VolumeSnapshotStatus};

    fn snapshot(annotations: &[(&str, &str)]) -> VolumeSnapshot {
        let mut vs = VolumeSnapshot::new("snap", VolumeSnapshotSpec::default());
        vs.metadata.namespace = Some("default".to_string());
        vs.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        vs.status = Some(VolumeSnapshotStatus {
            ready_to_use: Some(true),
            restore_size: Some("10Gi".to_string()),
        });
        vs
    }

    #[tokio::test]
    async fn test_dvcr_data_volume() {
        let (store, _) = memory_store();
        let disks = DiskService::new(store, Arc::new(DvcrSettings::new("dvcr")));
        let sup = Supplements::new("vd", "root", "default", "uid-1");

        disks
            .start(
                &DiskOrigin::Dvcr {
                    image: "dvcr/vd/default/root:latest".to_string(),
                },
                &DiskSettings {
                    size: Some("10Gi".to_string()),
                    storage_class: Some("local".to_string()),
                },
                &sup,
                create_test_pvc_owner(),
            )
            .await
            .unwrap();

        let dv = disks.get_data_volume(&sup).await.unwrap().unwrap();
        let registry = dv.spec.source.registry.unwrap();
        assert_eq!(registry.url, "docker://dvcr/vd/default/root:latest");
        assert!(registry.secret_ref.is_none());
        assert_eq!(dv.spec.pvc.access_modes, vec!["ReadWriteOnce"]);
        assert_eq!(dv.spec.pvc.resources.requests.get("storage").map(String::as_str), Some("10Gi"));
        assert_eq!(dv.spec.pvc.storage_class_name.as_deref(), Some("local"));
    }

    #[tokio::test]
    async fn test_restore_uses_deprecated_annotations() {
        let (store, _) = memory_store();
        let disks = DiskService::new(store, Arc::new(DvcrSettings::new("dvcr")));
        let sup = Supplements::new("vd", "root", "default", "uid-1");
        let vs = snapshot(&[
            (ANN_STORAGE_CLASS_NAME_DEPRECATED, "ceph"),
            (ANN_VOLUME_MODE, "Block"),
            (ANN_ACCESS_MODES_DEPRECATED, "ReadWriteMany"),
        ]);

        let pvc = disks.restore_pvc_from_snapshot(&vs, &sup, create_test_pvc_owner()).await.unwrap();

        let spec = pvc.spec.unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("ceph"));
        assert_eq!(spec.volume_mode.as_deref(), Some("Block"));
        assert_eq!(spec.access_modes, Some(vec!["ReadWriteMany".to_string()]));
        assert_eq!(spec.data_source.unwrap().name, "snap");
    }

    #[tokio::test]
    async fn test_clean_up_releases_protected_pvc() {
        let (store, backend) = memory_store();
        let disks = DiskService::new(store, Arc::new(DvcrSettings::new("dvcr")));
        let sup = Supplements::new("vd", "root", "default", "uid-1");
        disks
            .restore_pvc_from_snapshot(&snapshot(&[]), &sup, create_test_pvc_owner())
            .await
            .unwrap();

        assert!(disks.clean_up(&sup).await.unwrap());
        assert_eq!(backend.count("PersistentVolumeClaim"), 0);
    }
}
