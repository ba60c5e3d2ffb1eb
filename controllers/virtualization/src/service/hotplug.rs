//! Hotplug requests on KubeVirt VirtualMachines.
//!
//! Volumes are added to and removed from a running VM by appending volume
//! requests to the KVVM status; KubeVirt moves the volume into the template
//! and reports it in the KVVMI volume status once attached.

use tracing::info;

use crds::BlockDeviceKind;
use crds::kubevirt::{
    AddVolumeOptions, ContainerDiskSource, Disk, HotplugVolumeSource, KubeVirtVirtualMachine,
    KubeVirtVirtualMachineInstance, PvcVolumeSource, RemoveVolumeOptions, VolumeRequest,
};

use super::ServiceError;
use crate::store::{ObjectKey, Store};

const HOTPLUG_BUS: &str = "scsi";

/// Name of the KubeVirt volume for a block device.
pub fn volume_name(kind: BlockDeviceKind, name: &str) -> String {
    let prefix = match kind {
        BlockDeviceKind::VirtualDisk => "vd",
        BlockDeviceKind::VirtualImage => "vi",
        BlockDeviceKind::ClusterVirtualImage => "cvi",
    };
    format!("{prefix}-{name}")
}

/// Volume to hotplug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotplugRequest {
    /// KubeVirt volume name
    pub volume_name: String,
    /// Volume source
    pub source: HotplugVolumeSource,
    /// Attach as a CD-ROM
    pub cdrom: bool,
}

impl HotplugRequest {
    /// Hotplug of a PVC.
    pub fn pvc(volume_name: String, claim_name: String) -> Self {
        Self {
            volume_name,
            source: HotplugVolumeSource {
                persistent_volume_claim: Some(PvcVolumeSource {
                    claim_name,
                    hotpluggable: true,
                }),
                container_disk: None,
            },
            cdrom: false,
        }
    }

    /// Hotplug of a DVCR image.
    pub fn container_disk(volume_name: String, image: String, cdrom: bool) -> Self {
        Self {
            volume_name,
            source: HotplugVolumeSource {
                persistent_volume_claim: None,
                container_disk: Some(ContainerDiskSource {
                    image,
                    hotpluggable: true,
                }),
            },
            cdrom,
        }
    }
}

fn requests(kvvm: &KubeVirtVirtualMachine) -> &[VolumeRequest] {
    kvvm.status.as_ref().map(|s| s.volume_requests.as_slice()).unwrap_or_default()
}

/// Returns true when an add request for the volume is pending.
pub fn is_add_requested(kvvm: &KubeVirtVirtualMachine, volume_name: &str) -> bool {
    requests(kvvm)
        .iter()
        .any(|r| r.add_volume_options.as_ref().is_some_and(|o| o.name == volume_name))
}

/// Returns true when the volume is part of the VM template.
pub fn is_in_template(kvvm: &KubeVirtVirtualMachine, volume_name: &str) -> bool {
    kvvm.spec.template.spec.volumes.iter().any(|v| v.name == volume_name)
}

/// Returns true once the running instance reports the volume ready.
pub fn is_attached(kvvmi: Option<&KubeVirtVirtualMachineInstance>, volume_name: &str) -> bool {
    kvvmi.is_some_and(|i| i.is_volume_ready(volume_name))
}

/// Sends hotplug requests.
#[derive(Debug, Clone)]
pub struct HotplugService {
    store: Store,
}

impl HotplugService {
    /// Creates a hotplug service.
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Requests the volume to be attached; a pending request is left as is.
    pub async fn hotplug(&self, kvvm: &KubeVirtVirtualMachine, request: &HotplugRequest) -> Result<(), ServiceError> {
        if is_add_requested(kvvm, &request.volume_name) || is_in_template(kvvm, &request.volume_name) {
            return Ok(());
        }
        if kvvm.status.as_ref().is_none_or(|s| !s.ready) {
            return Err(ServiceError::Hotplug(format!(
                "virtual machine {} is not ready for hotplug",
                ObjectKey::of(kvvm)
            )));
        }

        let mut changed = kvvm.clone();
        changed
            .status
            .get_or_insert_with(Default::default)
            .volume_requests
            .push(VolumeRequest {
                add_volume_options: Some(AddVolumeOptions {
                    name: request.volume_name.clone(),
                    disk: Disk {
                        name: request.volume_name.clone(),
                        boot_order: None,
                        bus: HOTPLUG_BUS.to_string(),
                        cdrom: request.cdrom,
                    },
                    volume_source: request.source.clone(),
                }),
                remove_volume_options: None,
            });

        info!("Hotplug volume {} into {}", request.volume_name, ObjectKey::of(kvvm));
        self.store.update_status(kvvm, &changed).await?;
        Ok(())
    }

    /// Requests the volume to be detached; returns true when nothing is left to detach.
    pub async fn unplug(&self, kvvm: &KubeVirtVirtualMachine, volume_name: &str) -> Result<bool, ServiceError> {
        let attached = is_in_template(kvvm, volume_name);
        let pending_add = is_add_requested(kvvm, volume_name);
        let pending_remove = requests(kvvm)
            .iter()
            .any(|r| r.remove_volume_options.as_ref().is_some_and(|o| o.name == volume_name));
        if !attached && !pending_add {
            return Ok(true);
        }
        if attached && pending_remove {
            return Ok(false);
        }

        let mut changed = kvvm.clone();
        let status = changed.status.get_or_insert_with(Default::default);
        status
            .volume_requests
            .retain(|r| r.add_volume_options.as_ref().is_none_or(|o| o.name != volume_name));
        if attached {
            status.volume_requests.push(VolumeRequest {
                add_volume_options: None,
                remove_volume_options: Some(RemoveVolumeOptions {
                    name: volume_name.to_string(),
                }),
            });
        }

        info!("Unplug volume {} from {}", volume_name, ObjectKey::of(kvvm));
        self.store.update_status(kvvm, &changed).await?;
        Ok(!attached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_kvvm, memory_store};
    use crds::kubevirt::{KubeVirtVirtualMachineStatus, Volume};

    #[test]
    fn test_volume_names() {
        assert_eq!(volume_name(BlockDeviceKind::VirtualDisk, "data"), "vd-data");
        assert_eq!(volume_name(BlockDeviceKind::ClusterVirtualImage, "ubuntu"), "cvi-ubuntu");
    }

    #[tokio::test]
    async fn test_hotplug_is_requested_once() {
        let (store, backend) = memory_store();
        let mut kvvm = create_test_kvvm("vm", "default");
        kvvm.status = Some(KubeVirtVirtualMachineStatus {
            ready: true,
            ..Default::default()
        });
        backend.seed(&kvvm);
        let service = HotplugService::new(store.clone());
        let request = HotplugRequest::pvc("vd-data".to_string(), "d8v-vd-1".to_string());

        let kvvm: KubeVirtVirtualMachine = store.get(Some("default"), "vm").await.unwrap().unwrap();
        service.hotplug(&kvvm, &request).await.unwrap();
        let kvvm: KubeVirtVirtualMachine = store.get(Some("default"), "vm").await.unwrap().unwrap();
        service.hotplug(&kvvm, &request).await.unwrap();

        let kvvm: KubeVirtVirtualMachine = store.get(Some("default"), "vm").await.unwrap().unwrap();
        assert_eq!(requests(&kvvm).len(), 1);
        assert!(is_add_requested(&kvvm, "vd-data"));
    }

    #[tokio::test]
    async fn test_hotplug_needs_ready_vm() {
        let (store, _) = memory_store();
        let service = HotplugService::new(store);
        let request = HotplugRequest::pvc("vd-data".to_string(), "d8v-vd-1".to_string());

        let result = service.hotplug(&create_test_kvvm("vm", "default"), &request).await;

        assert!(matches!(result, Err(ServiceError::Hotplug(_))));
    }

    #[tokio::test]
    async fn test_unplug_attached_volume() {
        let (store, backend) = memory_store();
        let mut kvvm = create_test_kvvm("vm", "default");
        kvvm.spec.template.spec.volumes.push(Volume {
            name: "vd-data".to_string(),
            ..Default::default()
        });
        backend.seed(&kvvm);
        let service = HotplugService::new(store.clone());

        let kvvm: KubeVirtVirtualMachine = store.get(Some("default"), "vm").await.unwrap().unwrap();
        assert!(!service.unplug(&kvvm, "vd-data").await.unwrap());
        let kvvm: KubeVirtVirtualMachine = store.get(Some("default"), "vm").await.unwrap().unwrap();
        assert!(!service.unplug(&kvvm, "vd-data").await.unwrap());
        assert_eq!(requests(&kvvm).len(), 1);

        assert!(service.unplug(&kvvm, "vd-other").await.unwrap());
    }
}
