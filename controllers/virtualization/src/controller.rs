//! Main controller implementation.
//!
//! Starts one watcher per reconciled kind and waits for any of them to exit.
//! Related objects are watched too and mapped onto the reconciled kind:
//!
//! - images and disks: their importer/uploader supplements and the VMs using them
//! - VirtualMachine: its KVVM and KVVMI, attachments, IP claim and disks
//! - VirtualMachineIPAddressClaim: VMs using it and its lease
//! - VirtualMachineIPAddressLease: its claim

use std::fmt::Debug;
use std::sync::Arc;

use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::{Api, Client, Resource};
use kube_runtime::Controller as KubeController;
use kube_runtime::watcher;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::info;

use crds::cdi::DataVolume;
use crds::kubevirt::{KubeVirtVirtualMachine, KubeVirtVirtualMachineInstance};
use crds::{
    BlockDeviceKind, ClusterVirtualImage, VirtualDisk, VirtualImage, VirtualMachine,
    VirtualMachineBlockDeviceAttachment, VirtualMachineIPAddressClaim, VirtualMachineIPAddressLease,
};

use crate::context::Context;
use crate::error::ControllerError;
use crate::index::BlockDeviceKey;
use crate::provisioning::ProvisioningReconciler;
use crate::vm::VmReconciler;
use crate::vmbda::VmbdaReconciler;
use crate::vmip::{ClaimReconciler, LeaseReconciler};
use crate::watcher::{
    attachment_vm, claim_lease, claim_vm, controller_owner, device_users, lease_claim, same_name, vm_claim,
    vm_devices, watch_resource,
};

type WatcherHandle = JoinHandle<Result<(), ControllerError>>;

/// Main controller for virtualization resources.
#[derive(Debug)]
pub struct Controller {
    cvi_watcher: WatcherHandle,
    vi_watcher: WatcherHandle,
    vd_watcher: WatcherHandle,
    vm_watcher: WatcherHandle,
    vmbda_watcher: WatcherHandle,
    claim_watcher: WatcherHandle,
    lease_watcher: WatcherHandle,
}

/// Api for a namespaced kind, limited to `namespace` when set.
fn namespaced_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn config() -> watcher::Config {
    watcher::Config::default()
}

/// Fills the block-device index before any reconcile reads it.
async fn warm_index(ctx: &Context, namespace: Option<&str>) -> Result<(), ControllerError> {
    let vms: Vec<VirtualMachine> = ctx.store.list(namespace).await?;
    for vm in &vms {
        ctx.index.upsert_vm(vm);
    }
    info!("Indexed block devices of {} VirtualMachines", vms.len());
    Ok(())
}

fn finished(kind: &str, result: Result<Result<(), ControllerError>, tokio::task::JoinError>) -> Result<(), ControllerError> {
    result.map_err(|e| ControllerError::Watch(format!("{kind} watcher panicked: {e}")))?
}

impl Controller {
    /// Creates the controller and starts every watcher.
    pub async fn new(client: Client, ctx: Arc<Context>, namespace: Option<String>) -> Result<Self, ControllerError> {
        info!("Initializing virtualization controller");
        let ns = namespace.as_deref();

        warm_index(&ctx, ns).await?;

        let vm_api: Api<VirtualMachine> = namespaced_api(&client, ns);
        let claim_api: Api<VirtualMachineIPAddressClaim> = namespaced_api(&client, ns);
        let pod_api: Api<Pod> = namespaced_api(&client, ns);
        let pvc_api: Api<PersistentVolumeClaim> = namespaced_api(&client, ns);
        let dv_api: Api<DataVolume> = namespaced_api(&client, ns);

        // Importer Pods of cluster images run in the controller namespace.
        let cvi = KubeController::new(Api::<ClusterVirtualImage>::all(client.clone()), config())
            .watches(Api::<Pod>::all(client.clone()), config(), |pod| {
                controller_owner::<ClusterVirtualImage, _>(&pod, true)
            })
            .watches(vm_api.clone(), config(), |vm| {
                vm_devices::<ClusterVirtualImage>(&vm, BlockDeviceKind::ClusterVirtualImage)
            });
        let cvi_watcher = tokio::spawn(watch_resource(
            cvi,
            ProvisioningReconciler::<ClusterVirtualImage>::new(Arc::clone(&ctx)),
            "ClusterVirtualImage",
        ));

        let vi = KubeController::new(namespaced_api::<VirtualImage>(&client, ns), config())
            .owns(pod_api.clone(), config())
            .owns(pvc_api.clone(), config())
            .watches(vm_api.clone(), config(), |vm| {
                vm_devices::<VirtualImage>(&vm, BlockDeviceKind::VirtualImage)
            });
        let vi_watcher = tokio::spawn(watch_resource(
            vi,
            ProvisioningReconciler::<VirtualImage>::new(Arc::clone(&ctx)),
            "VirtualImage",
        ));

        let vd = KubeController::new(namespaced_api::<VirtualDisk>(&client, ns), config())
            .owns(pod_api, config())
            .owns(dv_api, config())
            .owns(pvc_api, config())
            .watches(vm_api.clone(), config(), |vm| {
                vm_devices::<VirtualDisk>(&vm, BlockDeviceKind::VirtualDisk)
            });
        let vd_watcher = tokio::spawn(watch_resource(
            vd,
            ProvisioningReconciler::<VirtualDisk>::new(Arc::clone(&ctx)),
            "VirtualDisk",
        ));

        let disk_index = ctx.index.clone();
        let image_index = ctx.index.clone();
        let cluster_image_index = ctx.index.clone();
        let vm = KubeController::new(vm_api.clone(), config())
            .watches(namespaced_api::<KubeVirtVirtualMachine>(&client, ns), config(), |kvvm| {
                same_name::<VirtualMachine, _>(&kvvm)
            })
            .watches(namespaced_api::<KubeVirtVirtualMachineInstance>(&client, ns), config(), |kvvmi| {
                same_name::<VirtualMachine, _>(&kvvmi)
            })
            .watches(namespaced_api::<VirtualMachineBlockDeviceAttachment>(&client, ns), config(), |vmbda| {
                attachment_vm(&vmbda)
            })
            .watches(claim_api.clone(), config(), |claim| claim_vm(&claim))
            .watches(namespaced_api::<VirtualDisk>(&client, ns), config(), move |vd| {
                let key = BlockDeviceKey::new(
                    BlockDeviceKind::VirtualDisk,
                    vd.metadata.namespace.as_deref().unwrap_or_default(),
                    vd.metadata.name.clone().unwrap_or_default(),
                );
                device_users(&disk_index, &key)
            })
            .watches(namespaced_api::<VirtualImage>(&client, ns), config(), move |vi| {
                let key = BlockDeviceKey::new(
                    BlockDeviceKind::VirtualImage,
                    vi.metadata.namespace.as_deref().unwrap_or_default(),
                    vi.metadata.name.clone().unwrap_or_default(),
                );
                device_users(&image_index, &key)
            })
            .watches(Api::<ClusterVirtualImage>::all(client.clone()), config(), move |cvi| {
                let key = BlockDeviceKey::cvi(cvi.metadata.name.clone().unwrap_or_default());
                device_users(&cluster_image_index, &key)
            });
        let vm_watcher = tokio::spawn(watch_resource(vm, VmReconciler::new(Arc::clone(&ctx)), "VirtualMachine"));

        let vmbda = KubeController::new(namespaced_api::<VirtualMachineBlockDeviceAttachment>(&client, ns), config());
        let vmbda_watcher = tokio::spawn(watch_resource(
            vmbda,
            VmbdaReconciler::new(Arc::clone(&ctx)),
            "VirtualMachineBlockDeviceAttachment",
        ));

        let claim = KubeController::new(claim_api.clone(), config())
            .watches(vm_api, config(), |vm| vm_claim(&vm))
            .watches(Api::<VirtualMachineIPAddressLease>::all(client.clone()), config(), |lease| {
                lease_claim(&lease)
            });
        let claim_watcher = tokio::spawn(watch_resource(
            claim,
            ClaimReconciler::new(Arc::clone(&ctx)),
            "VirtualMachineIPAddressClaim",
        ));

        let lease = KubeController::new(Api::<VirtualMachineIPAddressLease>::all(client.clone()), config())
            .watches(claim_api, config(), |claim| claim_lease(&claim));
        let lease_watcher = tokio::spawn(watch_resource(
            lease,
            LeaseReconciler::new(ctx),
            "VirtualMachineIPAddressLease",
        ));

        Ok(Self {
            cvi_watcher,
            vi_watcher,
            vd_watcher,
            vm_watcher,
            vmbda_watcher,
            claim_watcher,
            lease_watcher,
        })
    }

    /// Runs the controller until a watcher exits.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("Virtualization controller running");

        tokio::select! {
            result = &mut self.cvi_watcher => finished("ClusterVirtualImage", result)?,
            result = &mut self.vi_watcher => finished("VirtualImage", result)?,
            result = &mut self.vd_watcher => finished("VirtualDisk", result)?,
            result = &mut self.vm_watcher => finished("VirtualMachine", result)?,
            result = &mut self.vmbda_watcher => finished("VirtualMachineBlockDeviceAttachment", result)?,
            result = &mut self.claim_watcher => finished("VirtualMachineIPAddressClaim", result)?,
            result = &mut self.lease_watcher => finished("VirtualMachineIPAddressLease", result)?,
        }

        info!("Virtualization controller stopped");
        Ok(())
    }
}
