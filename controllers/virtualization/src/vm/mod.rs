//! VirtualMachine reconciler
//!
//! A reconcile loads the VirtualMachine together with the KubeVirt
//! VirtualMachine and VirtualMachineInstance of the same name and runs the
//! handler chain over all three. Handlers change the VM finalizers and status;
//! KubeVirt objects and IP address claims are written directly through the
//! store.

mod block_devices;
mod deletion;
mod ipam;
pub mod kvvm;
mod kvvm_sync;
mod lifecycle;
mod propagation;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crds::conditions::Condition;
use crds::kubevirt::{KubeVirtVirtualMachine, KubeVirtVirtualMachineInstance};
use crds::{VirtualMachine, VirtualMachineStatus};

use crate::context::Context;
use crate::error::ControllerError;
use crate::reconciler::chain::Chain;
use crate::reconciler::resource::Resource;
use crate::reconciler::{ReconcileResult, ReconcilerState, TwoPhaseReconciler};
use crate::service::block_device::DeviceInfo;
use crate::store::ObjectKey;

pub use block_devices::BlockDevicesHandler;
pub use deletion::DeletionHandler;
pub use ipam::IpamHandler;
pub use kvvm_sync::KvvmSyncHandler;
pub use lifecycle::LifecycleHandler;

/// Requeue delay while waiting for claims and block devices.
const DEPENDENCY_REQUEUE: Duration = Duration::from_secs(2);

/// Block device of the VM spec resolved to its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDevice {
    /// KubeVirt volume name
    pub volume_name: String,
    /// Device data
    pub info: DeviceInfo,
}

/// A VM together with its KubeVirt objects.
#[derive(Debug, Clone)]
pub struct Machine {
    /// Working copy of the VM
    pub vm: VirtualMachine,
    /// KubeVirt VirtualMachine, if created
    pub kvvm: Option<KubeVirtVirtualMachine>,
    /// KubeVirt VirtualMachineInstance, if running
    pub kvvmi: Option<KubeVirtVirtualMachineInstance>,
    /// Spec block devices in boot order; filled by the block devices handler
    pub devices: Vec<ResolvedDevice>,
}

impl Machine {
    /// Wraps a VM and its KubeVirt objects.
    pub fn new(
        vm: VirtualMachine,
        kvvm: Option<KubeVirtVirtualMachine>,
        kvvmi: Option<KubeVirtVirtualMachineInstance>,
    ) -> Self {
        Self {
            vm,
            kvvm,
            kvvmi,
            devices: Vec::new(),
        }
    }

    fn namespace(&self) -> &str {
        self.vm.metadata.namespace.as_deref().unwrap_or_default()
    }

    fn name(&self) -> &str {
        self.vm.metadata.name.as_deref().unwrap_or_default()
    }

    fn status_mut(&mut self) -> &mut VirtualMachineStatus {
        self.vm.status.get_or_insert_with(Default::default)
    }

    fn conditions(&self) -> &[Condition] {
        self.vm.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default()
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status_mut().conditions
    }
}

/// State of one VM reconcile.
#[derive(Debug)]
pub struct VmState {
    ctx: Arc<Context>,
    resource: Resource<VirtualMachine>,
    kvvm: Option<KubeVirtVirtualMachine>,
    kvvmi: Option<KubeVirtVirtualMachineInstance>,
}

#[async_trait]
impl ReconcilerState for VmState {
    async fn reload(&mut self) -> Result<(), ControllerError> {
        self.resource.fetch().await?;
        let key = self.resource.key().clone();
        if let Some(vm) = self.resource.current() {
            self.ctx.index.upsert_vm(vm);
            let namespace = key.namespace.as_deref();
            self.kvvm = self.ctx.store.get(namespace, &key.name).await?;
            self.kvvmi = self.ctx.store.get(namespace, &key.name).await?;
        } else {
            self.ctx.index.remove_vm(&key);
            self.kvvm = None;
            self.kvvmi = None;
        }
        Ok(())
    }

    fn should_reconcile(&self) -> bool {
        !self.resource.is_empty()
    }

    async fn apply_sync(&mut self) -> Result<(), ControllerError> {
        self.resource.update_meta().await?;
        Ok(())
    }

    async fn apply_update_status(&mut self) -> Result<(), ControllerError> {
        self.resource.update_status().await?;
        if let Some(vm) = self.resource.changed() {
            let released = crate::meta::is_deleting(vm)
                && !crate::meta::has_finalizer(vm, crds::annotations::FINALIZER_VM_CLEANUP);
            if !released {
                self.ctx.index.upsert_vm(vm);
            }
        }
        Ok(())
    }
}

/// Reconciles VirtualMachines.
#[derive(Debug)]
pub struct VmReconciler {
    ctx: Arc<Context>,
    chain: Chain<Machine>,
}

impl VmReconciler {
    /// Creates the reconciler.
    pub fn new(ctx: Arc<Context>) -> Self {
        let chain = Chain::new()
            .with(DeletionHandler::new(Arc::clone(&ctx)))
            .with(IpamHandler::new(Arc::clone(&ctx)))
            .with(BlockDevicesHandler::new(Arc::clone(&ctx)))
            .with(KvvmSyncHandler::new(Arc::clone(&ctx)))
            .with(LifecycleHandler::new(Arc::clone(&ctx)));
        Self { ctx, chain }
    }
}

#[async_trait]
impl TwoPhaseReconciler for VmReconciler {
    type State = VmState;

    fn new_state(&self, key: &ObjectKey) -> Self::State {
        VmState {
            ctx: Arc::clone(&self.ctx),
            resource: Resource::new(key.clone(), self.ctx.store.clone()),
            kvvm: None,
            kvvmi: None,
        }
    }

    async fn sync(&self, state: &mut Self::State) -> Result<ReconcileResult, ControllerError> {
        let key = state.resource.key().clone();
        let Some(vm) = state.resource.changed_mut() else {
            return Ok(ReconcileResult::done());
        };
        info!("Reconciling VirtualMachine {}", key);

        let mut machine = Machine::new(vm.clone(), state.kvvm.take(), state.kvvmi.take());
        let result = self.chain.run(&mut machine).await;
        *vm = machine.vm;
        state.kvvm = machine.kvvm;
        state.kvvmi = machine.kvvmi;
        result
    }

    async fn update_status(&self, _state: &mut Self::State) -> Result<ReconcileResult, ControllerError> {
        Ok(ReconcileResult::done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta;
    use crate::reconciler::reconcile;
    use crate::test_utils::{create_test_vm, test_context};
    use crds::annotations::{ANN_VM_LAST_APPLIED_SPEC, FINALIZER_VM_CLEANUP};
    use crds::conditions::find_condition;
    use crds::{ClaimPhase, MachinePhase, VirtualMachineIPAddressClaim, VirtualMachineIPAddressClaimStatus};

    async fn bind_claim(ctx: &Context, namespace: &str, name: &str) {
        let mut claim: VirtualMachineIPAddressClaim = ctx.store.get(Some(namespace), name).await.unwrap().unwrap();
        let current = claim.clone();
        claim.status = Some(VirtualMachineIPAddressClaimStatus {
            phase: ClaimPhase::Bound,
            address: "10.66.10.1".to_string(),
            ..Default::default()
        });
        ctx.store.update_status(&current, &claim).await.unwrap();
    }

    #[tokio::test]
    async fn test_new_vm_creates_claim_then_kvvm() {
        let (ctx, backend, _) = test_context();
        backend.seed(&create_test_vm("web", "default"));
        let reconciler = VmReconciler::new(Arc::clone(&ctx));
        let key = ObjectKey::namespaced("default", "web");

        let result = reconcile(&reconciler, &key).await.unwrap();

        assert!(!result.is_empty());
        assert_eq!(backend.count("VirtualMachineIPAddressClaim"), 1);
        let stored: VirtualMachine = ctx.store.get(Some("default"), "web").await.unwrap().unwrap();
        assert!(meta::has_finalizer(&stored, FINALIZER_VM_CLEANUP));
        let status = stored.status.unwrap();
        assert_eq!(status.phase, MachinePhase::Pending);
        let ip = find_condition(&status.conditions, "IPAddressReady").unwrap();
        assert_eq!(ip.reason, "IPAddressNotReady");
        let kvvm: Option<KubeVirtVirtualMachine> = ctx.store.get(Some("default"), "web").await.unwrap();
        assert!(kvvm.is_none());

        bind_claim(&ctx, "default", "web").await;
        reconcile(&reconciler, &key).await.unwrap();

        let kvvm: KubeVirtVirtualMachine = ctx.store.get(Some("default"), "web").await.unwrap().unwrap();
        assert!(meta::annotation(&kvvm, ANN_VM_LAST_APPLIED_SPEC).is_some());
        let stored: VirtualMachine = ctx.store.get(Some("default"), "web").await.unwrap().unwrap();
        let status = stored.status.unwrap();
        assert_eq!(status.ip_address, "10.66.10.1");
        assert!(find_condition(&status.conditions, "ConfigurationApplied").unwrap().is_true());
    }

    #[tokio::test]
    async fn test_deleted_vm_removes_kvvm_and_releases_finalizer() {
        let (ctx, backend, _) = test_context();
        backend.seed(&create_test_vm("web", "default"));
        let reconciler = VmReconciler::new(Arc::clone(&ctx));
        let key = ObjectKey::namespaced("default", "web");
        reconcile(&reconciler, &key).await.unwrap();
        bind_claim(&ctx, "default", "web").await;
        reconcile(&reconciler, &key).await.unwrap();
        let kvvm: Option<KubeVirtVirtualMachine> = ctx.store.get(Some("default"), "web").await.unwrap();
        assert!(kvvm.is_some());

        ctx.store.delete::<VirtualMachine>(Some("default"), "web").await.unwrap();
        reconcile(&reconciler, &key).await.unwrap();
        reconcile(&reconciler, &key).await.unwrap();

        let stored: Option<VirtualMachine> = ctx.store.get(Some("default"), "web").await.unwrap();
        assert!(stored.is_none());
        let kvvm: Option<KubeVirtVirtualMachine> = ctx.store.get(Some("default"), "web").await.unwrap();
        assert!(kvvm.is_none());
    }
}
