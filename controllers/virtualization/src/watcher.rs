//! Kubernetes resource watchers.
//!
//! Every kind runs in its own `kube_runtime::Controller`. The runtime only
//! hands over the object; the two-phase reconciler re-reads everything it
//! needs through the store, so one generic `watch_resource()` serves all kinds.
//!
//! The mappers below turn changes of related objects into keys of the
//! reconciled kind.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::Resource;
use kube_runtime::Controller;
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::reflector::ObjectRef;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crds::annotations::ANN_BOUND_VIRTUAL_MACHINE_NAME;
use crds::{
    BlockDeviceKind, VirtualMachine, VirtualMachineBlockDeviceAttachment, VirtualMachineIPAddressClaim,
    VirtualMachineIPAddressLease,
};

use crate::backoff::BackoffTracker;
use crate::error::ControllerError;
use crate::index::{BlockDeviceIndex, BlockDeviceKey};
use crate::reconciler::{TwoPhaseReconciler, reconcile};
use crate::service::ipam::claim_name;
use crate::store::ObjectKey;

/// Delay before retrying a reconcile that lost a write race.
const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Reconciler plus the per-key retry state handed to the runtime.
#[derive(Debug)]
pub struct WatchContext<R> {
    reconciler: R,
    backoff: BackoffTracker,
    kind: &'static str,
}

async fn reconcile_object<K, R>(obj: Arc<K>, ctx: Arc<WatchContext<R>>) -> Result<Action, ControllerError>
where
    K: Resource,
    R: TwoPhaseReconciler,
{
    let key = ObjectKey::of(&*obj);
    debug!("Reconciling {} {}", ctx.kind, key);
    let result = reconcile(&ctx.reconciler, &key).await?;
    ctx.backoff.reset(&key.to_string());
    Ok(result.into_action())
}

fn error_policy<K, R>(obj: Arc<K>, error: &ControllerError, ctx: Arc<WatchContext<R>>) -> Action
where
    K: Resource,
{
    let key = ObjectKey::of(&*obj);
    if error.is_conflict() {
        debug!("Conflict reconciling {} {}: {}", ctx.kind, key, error);
        return Action::requeue(CONFLICT_REQUEUE);
    }
    let delay = ctx.backoff.next(&key.to_string());
    error!("Reconciliation error for {} {}: {} (retry in {:?})", ctx.kind, key, error, delay);
    Action::requeue(delay)
}

/// Runs the controller until its watch stream ends.
///
/// Reconciles are limited to a few at a time per kind and debounced so a
/// burst of status updates results in a single pass.
pub async fn watch_resource<K, R>(
    controller: Controller<K>,
    reconciler: R,
    kind: &'static str,
) -> Result<(), ControllerError>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    R: TwoPhaseReconciler + Debug + 'static,
{
    info!("Starting {} watcher", kind);

    let ctx = Arc::new(WatchContext {
        reconciler,
        backoff: BackoffTracker::default(),
        kind,
    });
    let config = ControllerConfig::default()
        .debounce(Duration::from_millis(500))
        .concurrency(4);

    controller
        .with_config(config)
        .shutdown_on_signal()
        .run(reconcile_object::<K, R>, error_policy::<K, R>, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!("Reconciled {} {}", kind, obj.name),
                Err(e) => warn!("Controller error for {}: {}", kind, e),
            }
        })
        .await;

    info!("{} watcher stopped", kind);
    Ok(())
}

/// Object with the same name and namespace, e.g. the VM of a KVVM.
pub fn same_name<K, Other>(obj: &Other) -> Option<ObjectRef<K>>
where
    K: Resource<DynamicType = ()>,
    Other: Resource,
{
    let name = obj.meta().name.as_deref()?;
    let obj_ref = ObjectRef::new(name);
    Some(match obj.meta().namespace.as_deref() {
        Some(ns) => obj_ref.within(ns),
        None => obj_ref,
    })
}

/// Controller owner of the given kind; cluster-scoped owners get no namespace.
pub fn controller_owner<K, Other>(obj: &Other, cluster_scoped: bool) -> Option<ObjectRef<K>>
where
    K: Resource<DynamicType = ()>,
    Other: Resource,
{
    let kind = K::kind(&());
    let owner = obj
        .meta()
        .owner_references
        .iter()
        .flatten()
        .find(|o| o.controller == Some(true) && o.kind == kind)?;
    let obj_ref = ObjectRef::new(&owner.name);
    match obj.meta().namespace.as_deref() {
        Some(ns) if !cluster_scoped => Some(obj_ref.within(ns)),
        _ => Some(obj_ref),
    }
}

/// Devices of the given kind a VM refers to in its spec or status.
pub fn vm_devices<K>(vm: &VirtualMachine, kind: BlockDeviceKind) -> Vec<ObjectRef<K>>
where
    K: Resource<DynamicType = ()>,
{
    let namespace = vm.metadata.namespace.as_deref().unwrap_or_default();
    let spec = vm.spec.block_device_refs.iter().map(|r| (r.kind, r.name.as_str()));
    let status = vm
        .status
        .iter()
        .flat_map(|s| s.block_device_refs.iter())
        .map(|r| (r.kind, r.name.as_str()));
    let mut names: Vec<&str> = spec.chain(status).filter(|(k, _)| *k == kind).map(|(_, n)| n).collect();
    names.sort_unstable();
    names.dedup();
    names
        .into_iter()
        .map(|name| match kind {
            BlockDeviceKind::ClusterVirtualImage => ObjectRef::new(name),
            _ => ObjectRef::new(name).within(namespace),
        })
        .collect()
}

/// VMs the index records as users of a device.
pub fn device_users(index: &BlockDeviceIndex, key: &BlockDeviceKey) -> Vec<ObjectRef<VirtualMachine>> {
    index
        .vms_using(key)
        .into_iter()
        .map(|vm| {
            let obj_ref = ObjectRef::new(&vm.name);
            match vm.namespace.as_deref() {
                Some(ns) => obj_ref.within(ns),
                None => obj_ref,
            }
        })
        .collect()
}

/// Target VM of an attachment.
pub fn attachment_vm(vmbda: &VirtualMachineBlockDeviceAttachment) -> Option<ObjectRef<VirtualMachine>> {
    let ns = vmbda.metadata.namespace.as_deref()?;
    Some(ObjectRef::new(&vmbda.spec.virtual_machine_name).within(ns))
}

/// VM bound to a claim.
pub fn claim_vm(claim: &VirtualMachineIPAddressClaim) -> Option<ObjectRef<VirtualMachine>> {
    let ns = claim.metadata.namespace.as_deref()?;
    let vm = claim.metadata.annotations.as_ref()?.get(ANN_BOUND_VIRTUAL_MACHINE_NAME)?;
    Some(ObjectRef::new(vm).within(ns))
}

/// Claim a VM uses, explicit or implicit.
pub fn vm_claim(vm: &VirtualMachine) -> Option<ObjectRef<VirtualMachineIPAddressClaim>> {
    let ns = vm.metadata.namespace.as_deref()?;
    Some(ObjectRef::new(&claim_name(vm)).within(ns))
}

/// Claim a lease points at.
pub fn lease_claim(lease: &VirtualMachineIPAddressLease) -> Option<ObjectRef<VirtualMachineIPAddressClaim>> {
    let claim_ref = lease.spec.claim_ref.as_ref()?;
    Some(ObjectRef::new(&claim_ref.name).within(&claim_ref.namespace))
}

/// Lease a claim holds or asks for.
pub fn claim_lease(claim: &VirtualMachineIPAddressClaim) -> Option<ObjectRef<VirtualMachineIPAddressLease>> {
    let from_status = claim.status.as_ref().map(|s| s.lease.as_str()).filter(|l| !l.is_empty());
    let from_spec = Some(claim.spec.virtual_machine_ip_address_lease_name.as_str()).filter(|l| !l.is_empty());
    from_status.or(from_spec).map(ObjectRef::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_kvvm, create_test_lease, create_test_vm};
    use crds::kubevirt::KubeVirtVirtualMachine;
    use crds::{BlockDeviceSpecRef, ClaimRef, VirtualDisk};
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    #[test]
    fn test_kvvm_maps_to_vm() {
        let kvvm: KubeVirtVirtualMachine = create_test_kvvm("web", "default");

        let vm: ObjectRef<VirtualMachine> = same_name(&kvvm).unwrap();

        assert_eq!(vm.name, "web");
        assert_eq!(vm.namespace.as_deref(), Some("default"));
    }

    #[test]
    fn test_controller_owner_of_cluster_image_has_no_namespace() {
        let mut pod = Pod::default();
        pod.metadata.namespace = Some("d8-virtualization".to_string());
        pod.metadata.owner_references = Some(vec![OwnerReference {
            kind: "ClusterVirtualImage".to_string(),
            name: "ubuntu".to_string(),
            controller: Some(true),
            ..Default::default()
        }]);

        let cvi: ObjectRef<crds::ClusterVirtualImage> = controller_owner(&pod, true).unwrap();
        assert_eq!(cvi.name, "ubuntu");
        assert!(cvi.namespace.is_none());

        let other: Option<ObjectRef<VirtualDisk>> = controller_owner(&pod, false);
        assert!(other.is_none());
    }

    #[test]
    fn test_vm_devices_of_kind() {
        let mut vm = create_test_vm("web", "default");
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

        let disks: Vec<ObjectRef<VirtualDisk>> = vm_devices(&vm, BlockDeviceKind::VirtualDisk);
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].namespace.as_deref(), Some("default"));

        let images: Vec<ObjectRef<crds::ClusterVirtualImage>> = vm_devices(&vm, BlockDeviceKind::ClusterVirtualImage);
        assert_eq!(images.len(), 1);
        assert!(images[0].namespace.is_none());
    }

    #[test]
    fn test_vm_maps_to_implicit_claim() {
        let vm = create_test_vm("web", "default");

        let claim = vm_claim(&vm).unwrap();

        assert_eq!(claim.name, "web");
    }

    #[test]
    fn test_lease_maps_to_claim() {
        let mut lease = create_test_lease("10.66.10.7");
        assert!(lease_claim(&lease).is_none());

        lease.spec.claim_ref = Some(ClaimRef {
            namespace: "default".to_string(),
            name: "web".to_string(),
        });
        let claim = lease_claim(&lease).unwrap();
        assert_eq!(claim.name, "web");
        assert_eq!(claim.namespace.as_deref(), Some("default"));
    }
}
