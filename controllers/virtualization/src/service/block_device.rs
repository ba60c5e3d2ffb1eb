//! Block devices as seen by a VM.
//!
//! Resolves a VirtualDisk, VirtualImage or ClusterVirtualImage into what the
//! KubeVirt VM needs: a PVC or a DVCR image, the size and readiness.

use crds::kubevirt::{ContainerDiskSource, PvcVolumeSource, Volume};
use crds::{BlockDeviceKind, ClusterVirtualImage, VirtualDisk, VirtualImage};

use super::hotplug::HotplugRequest;
use crate::provisionable::{Phase, Provisionable};
use crate::store::{Store, StoreError};

/// Resolved block device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Device is Ready
    pub ready: bool,
    /// Human-readable size
    pub size: String,
    /// PVC holding the data; empty for images in DVCR
    pub pvc_name: String,
    /// DVCR image; empty for data on a PVC
    pub image: String,
    /// ISO image
    pub cdrom: bool,
}

impl DeviceInfo {
    fn from_disk(vd: &VirtualDisk) -> Self {
        let status = vd.status.clone().unwrap_or_default();
        Self {
            ready: vd.phase() == Phase::Ready,
            size: status.capacity,
            pvc_name: status.target.pvc_name,
            image: String::new(),
            cdrom: false,
        }
    }

    fn from_image<K: Provisionable>(obj: &K, status: Option<&crds::ImageStatus>) -> Self {
        let status = status.cloned().unwrap_or_default();
        let (pvc_name, image) = if obj.is_stored_on_pvc() {
            (status.target.pvc_name, String::new())
        } else {
            (String::new(), status.target.registry_url)
        };
        Self {
            ready: obj.phase() == Phase::Ready,
            size: status.size.unpacked,
            pvc_name,
            image,
            cdrom: status.cdrom,
        }
    }

    /// Template volume backed by the device.
    pub fn volume(&self, name: String, hotpluggable: bool) -> Volume {
        let mut volume = Volume {
            name,
            ..Default::default()
        };
        if self.pvc_name.is_empty() {
            volume.container_disk = Some(ContainerDiskSource {
                image: self.image.clone(),
                hotpluggable,
            });
        } else {
            volume.persistent_volume_claim = Some(PvcVolumeSource {
                claim_name: self.pvc_name.clone(),
                hotpluggable,
            });
        }
        volume
    }

    /// Hotplug request for the device.
    pub fn hotplug_request(&self, volume_name: String) -> HotplugRequest {
        if self.pvc_name.is_empty() {
            HotplugRequest::container_disk(volume_name, self.image.clone(), self.cdrom)
        } else {
            HotplugRequest::pvc(volume_name, self.pvc_name.clone())
        }
    }
}

/// Looks up a device referenced from a VM in `vm_namespace`; `None` if it does not exist.
pub async fn resolve(
    store: &Store,
    kind: BlockDeviceKind,
    vm_namespace: &str,
    name: &str,
) -> Result<Option<DeviceInfo>, StoreError> {
    let info = match kind {
        BlockDeviceKind::VirtualDisk => store
            .get::<VirtualDisk>(Some(vm_namespace), name)
            .await?
            .map(|vd| DeviceInfo::from_disk(&vd)),
        BlockDeviceKind::VirtualImage => store
            .get::<VirtualImage>(Some(vm_namespace), name)
            .await?
            .map(|vi| DeviceInfo::from_image(&vi, vi.status.as_ref())),
        BlockDeviceKind::ClusterVirtualImage => store
            .get::<ClusterVirtualImage>(None, name)
            .await?
            .map(|cvi| DeviceInfo::from_image(&cvi, cvi.status.as_ref())),
    };
    Ok(info)
}
