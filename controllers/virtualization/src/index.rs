//! Reverse index from block devices to the VirtualMachines that use them.
//!
//! Fed by the VirtualMachine watcher; the image and disk handlers ask it
//! whether anything still references a device instead of listing every VM.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use crds::{BlockDeviceKind, VirtualMachine};

use crate::store::ObjectKey;

/// A block device as seen from a VM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockDeviceKey {
    /// Device kind
    pub kind: BlockDeviceKind,
    /// Namespace, empty for ClusterVirtualImage
    pub namespace: String,
    /// Device name
    pub name: String,
}

impl BlockDeviceKey {
    /// Key of a device referenced from a VM in `vm_namespace`.
    pub fn new(kind: BlockDeviceKind, vm_namespace: &str, name: impl Into<String>) -> Self {
        let namespace = match kind {
            BlockDeviceKind::ClusterVirtualImage => String::new(),
            BlockDeviceKind::VirtualImage | BlockDeviceKind::VirtualDisk => vm_namespace.to_string(),
        };
        Self {
            kind,
            namespace,
            name: name.into(),
        }
    }

    /// Key of a ClusterVirtualImage.
    pub fn cvi(name: impl Into<String>) -> Self {
        Self::new(BlockDeviceKind::ClusterVirtualImage, "", name)
    }
}

#[derive(Debug, Default)]
struct Inner {
    by_device: HashMap<BlockDeviceKey, BTreeSet<ObjectKey>>,
    by_vm: HashMap<ObjectKey, BTreeSet<BlockDeviceKey>>,
}

/// Shared block-device → VM index.
#[derive(Debug, Clone, Default)]
pub struct BlockDeviceIndex {
    inner: Arc<RwLock<Inner>>,
}

fn devices_of(vm: &VirtualMachine) -> BTreeSet<BlockDeviceKey> {
    let namespace = vm.metadata.namespace.as_deref().unwrap_or_default();
    let from_spec = vm
        .spec
        .block_device_refs
        .iter()
        .map(|r| BlockDeviceKey::new(r.kind, namespace, r.name.clone()));
    let from_status = vm
        .status
        .iter()
        .flat_map(|s| s.block_device_refs.iter())
        .map(|r| BlockDeviceKey::new(r.kind, namespace, r.name.clone()));
    from_spec.chain(from_status).collect()
}

impl BlockDeviceIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the devices a VM references in its spec and status.
    pub fn upsert_vm(&self, vm: &VirtualMachine) {
        let vm_key = ObjectKey::of(vm);
        let devices = devices_of(vm);
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        Self::unlink(&mut inner, &vm_key);
        for device in &devices {
            inner.by_device.entry(device.clone()).or_default().insert(vm_key.clone());
        }
        if !devices.is_empty() {
            inner.by_vm.insert(vm_key, devices);
        }
    }

    /// Forgets a deleted VM.
    pub fn remove_vm(&self, vm_key: &ObjectKey) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        Self::unlink(&mut inner, vm_key);
    }

    fn unlink(inner: &mut Inner, vm_key: &ObjectKey) {
        let Some(previous) = inner.by_vm.remove(vm_key) else {
            return;
        };
        for device in previous {
            if let Some(vms) = inner.by_device.get_mut(&device) {
                vms.remove(vm_key);
                if vms.is_empty() {
                    inner.by_device.remove(&device);
                }
            }
        }
    }

    /// VMs referencing the device, sorted by key.
    pub fn vms_using(&self, device: &BlockDeviceKey) -> Vec<ObjectKey> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .by_device
            .get(device)
            .map(|vms| vms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns true when any VM references the device.
    pub fn is_used(&self, device: &BlockDeviceKey) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.by_device.contains_key(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_vm;
    use crds::BlockDeviceSpecRef;

    #[test]
    fn test_index_follows_vm_updates() {
        let index = BlockDeviceIndex::new();
        let mut vm = create_test_vm("vm-1", "default");
        vm.spec.block_device_refs = vec![
            BlockDeviceSpecRef {
                kind: BlockDeviceKind::VirtualDisk,
                name: "root".to_string(),
            },
            BlockDeviceSpecRef {
                kind: BlockDeviceKind::ClusterVirtualImage,
                name: "ubuntu".to_string(),
            },
        ];
        index.upsert_vm(&vm);

        let root = BlockDeviceKey::new(BlockDeviceKind::VirtualDisk, "default", "root");
        assert_eq!(index.vms_using(&root), vec![ObjectKey::namespaced("default", "vm-1")]);
        assert!(index.is_used(&BlockDeviceKey::cvi("ubuntu")));

        vm.spec.block_device_refs.truncate(1);
        index.upsert_vm(&vm);
        assert!(!index.is_used(&BlockDeviceKey::cvi("ubuntu")));

        index.remove_vm(&ObjectKey::of(&vm));
        assert!(index.vms_using(&root).is_empty());
    }

    #[test]
    fn test_same_disk_name_in_other_namespace_is_distinct() {
        let index = BlockDeviceIndex::new();
        let mut vm = create_test_vm("vm-1", "team-a");
        vm.spec.block_device_refs = vec![BlockDeviceSpecRef {
            kind: BlockDeviceKind::VirtualDisk,
            name: "root".to_string(),
        }];
        index.upsert_vm(&vm);

        let other = BlockDeviceKey::new(BlockDeviceKind::VirtualDisk, "team-b", "root");
        assert!(!index.is_used(&other));
    }
}
