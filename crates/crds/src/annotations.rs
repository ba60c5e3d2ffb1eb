//! Annotation, label and finalizer names shared by the controllers.

/// Prefix of controller-owned annotations.
pub const ANN_API_GROUP: &str = "virt.deckhouse.io";

/// External upload URL published on the uploader Ingress.
pub const ANN_UPLOAD_URL: &str = "virt.deckhouse.io/upload.url";

/// Keeps importer/uploader Pods after provisioning completes.
pub const ANN_POD_RETAIN_AFTER_COMPLETION: &str = "virt.deckhouse.io/storage.pod.retainAfterCompletion";

/// Import progress reported by the importer/uploader Pod, e.g. `"42.5%"`.
pub const ANN_IMPORT_PROGRESS: &str = "virt.deckhouse.io/import.progress";

/// Average transfer speed in bytes per second reported by the importer/uploader Pod.
pub const ANN_IMPORT_AVG_SPEED: &str = "virt.deckhouse.io/import.avg-speed";

/// Current transfer speed in bytes per second reported by the importer/uploader Pod.
pub const ANN_IMPORT_CUR_SPEED: &str = "virt.deckhouse.io/import.cur-speed";

/// Name of the resource that created a supplementary Pod.
pub const ANN_CREATED_BY_NAME: &str = "virt.deckhouse.io/created-by.name";

/// Namespace of the resource that created a supplementary Pod.
pub const ANN_CREATED_BY_NAMESPACE: &str = "virt.deckhouse.io/created-by.namespace";

/// JSON of the VirtualMachine spec last applied to the KubeVirt VirtualMachine.
pub const ANN_VM_LAST_APPLIED_SPEC: &str = "virt.deckhouse.io/vm.last-applied-spec";

/// Address the CNI assigns to the VM Pod.
pub const ANN_IP_ADDRESS_CNI_REQUEST: &str = "cni.cilium.io/ipAddress";

/// Name of the VirtualMachine an IP address claim is bound to.
pub const ANN_BOUND_VIRTUAL_MACHINE_NAME: &str = "virt.deckhouse.io/bound-virtual-machine-name";

/// Storage class of the PVC a VolumeSnapshot was taken from.
pub const ANN_STORAGE_CLASS_NAME: &str = "virtualization.deckhouse.io/storage-class-name";

/// Volume mode of the PVC a VolumeSnapshot was taken from.
pub const ANN_VOLUME_MODE: &str = "virtualization.deckhouse.io/volume-mode";

/// Comma-separated access modes of the PVC a VolumeSnapshot was taken from.
pub const ANN_ACCESS_MODES: &str = "virtualization.deckhouse.io/access-modes";

/// Deprecated spelling of [`ANN_STORAGE_CLASS_NAME`].
pub const ANN_STORAGE_CLASS_NAME_DEPRECATED: &str = "virt.deckhouse.io/storage-class-name";

/// Deprecated spelling of [`ANN_VOLUME_MODE`].
pub const ANN_VOLUME_MODE_DEPRECATED: &str = "virt.deckhouse.io/volume-mode";

/// Deprecated spelling of [`ANN_ACCESS_MODES`].
pub const ANN_ACCESS_MODES_DEPRECATED: &str = "virt.deckhouse.io/access-modes";

/// JSON of the VirtualMachine labels last copied onto the KubeVirt VirtualMachine.
pub const ANN_LAST_PROPAGATED_LABELS: &str = "virt.deckhouse.io/last-propagated-labels";

/// JSON of the VirtualMachine annotations last copied onto the KubeVirt VirtualMachine.
pub const ANN_LAST_PROPAGATED_ANNOTATIONS: &str = "virt.deckhouse.io/last-propagated-annotations";

/// Selects the uploader Pod behind its Service.
pub const LABEL_UPLOADER_SERVICE: &str = "virtualization.deckhouse.io/uploader-service";

/// Marks an IP address claim created by the VM controller.
pub const LABEL_IMPLICIT_IP_ADDRESS_CLAIM: &str = "virtualization.deckhouse.io/implicit-ip-address-claim";

/// Requests switching the DVCR deployment into maintenance mode for garbage collection.
pub const ANN_DVCR_SWITCH_TO_MAINTENANCE: &str =
    "virtualization.deckhouse.io/dvcr-deployment-switch-to-maintenance-mode";

/// Set on the maintenance Secret once garbage collection is done.
pub const ANN_DVCR_GC_DONE: &str = "virtualization.deckhouse.io/dvcr-garbage-collection-done";

/// Name of the Secret that tracks DVCR maintenance.
pub const DVCR_MAINTENANCE_SECRET_NAME: &str = "dvcr-maintenance";

/// Finalizer protecting supplementary Pods while provisioning runs.
pub const FINALIZER_POD_PROTECTION: &str = "virtualization.deckhouse.io/pod-protection";

/// Finalizer protecting supplementary PVCs while provisioning runs.
pub const FINALIZER_PVC_PROTECTION: &str = "virtualization.deckhouse.io/pvc-protection";

/// Protection finalizer of a ClusterVirtualImage in use by VMs.
pub const FINALIZER_CVI_PROTECTION: &str = "virtualization.deckhouse.io/cvi-protection";

/// Cleanup finalizer of a ClusterVirtualImage.
pub const FINALIZER_CVI_CLEANUP: &str = "virtualization.deckhouse.io/cvi-cleanup";

/// Protection finalizer of a VirtualImage in use by VMs.
pub const FINALIZER_VI_PROTECTION: &str = "virtualization.deckhouse.io/vi-protection";

/// Cleanup finalizer of a VirtualImage.
pub const FINALIZER_VI_CLEANUP: &str = "virtualization.deckhouse.io/vi-cleanup";

/// Protection finalizer of a VirtualDisk in use by VMs.
pub const FINALIZER_VD_PROTECTION: &str = "virtualization.deckhouse.io/vd-protection";

/// Cleanup finalizer of a VirtualDisk.
pub const FINALIZER_VD_CLEANUP: &str = "virtualization.deckhouse.io/vd-cleanup";

/// Cleanup finalizer of a VirtualMachine.
pub const FINALIZER_VM_CLEANUP: &str = "virtualization.deckhouse.io/vm-cleanup";

/// Cleanup finalizer of a VirtualMachineBlockDeviceAttachment.
pub const FINALIZER_VMBDA_CLEANUP: &str = "virtualization.deckhouse.io/vmbda-cleanup";

/// Cleanup finalizer of a VirtualMachineIPAddressClaim.
pub const FINALIZER_VMIP_CLEANUP: &str = "virtualization.deckhouse.io/vmip-cleanup";

/// Returns the first non-empty annotation among `names`.
#[must_use]
pub fn first_annotation<'a>(
    annotations: Option<&'a std::collections::BTreeMap<String, String>>,
    names: &[&str],
) -> Option<&'a str> {
    let annotations = annotations?;
    names
        .iter()
        .filter_map(|name| annotations.get(*name))
        .map(String::as_str)
        .find(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_first_annotation_falls_back_to_deprecated_name() {
        let mut annotations = BTreeMap::new();
        annotations.insert(ANN_STORAGE_CLASS_NAME_DEPRECATED.to_string(), "local".to_string());

        let found = first_annotation(
            Some(&annotations),
            &[ANN_STORAGE_CLASS_NAME, ANN_STORAGE_CLASS_NAME_DEPRECATED],
        );
        assert_eq!(found, Some("local"));
    }

    #[test]
    fn test_first_annotation_prefers_current_name() {
        let mut annotations = BTreeMap::new();
        annotations.insert(ANN_VOLUME_MODE.to_string(), "Block".to_string());
        annotations.insert(ANN_VOLUME_MODE_DEPRECATED.to_string(), "Filesystem".to_string());

        let found = first_annotation(Some(&annotations), &[ANN_VOLUME_MODE, ANN_VOLUME_MODE_DEPRECATED]);
        assert_eq!(found, Some("Block"));
    }
}
