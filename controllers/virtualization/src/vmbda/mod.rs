//! VirtualMachineBlockDeviceAttachment reconciler
//!
//! Hotplugs a disk or an image into a running VM. Readiness of the device and
//! of the VM is tracked in two conditions; the lifecycle handler sends the
//! hotplug request once both hold and detaches the device on deletion.

mod lifecycle;
mod ready;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crds::conditions::{Condition, find_condition};
use crds::{
    BlockDeviceKind, VirtualMachine, VirtualMachineBlockDeviceAttachment, VirtualMachineBlockDeviceAttachmentStatus,
};

use crate::context::Context;
use crate::error::ControllerError;
use crate::reconciler::chain::Chain;
use crate::reconciler::resource::Resource;
use crate::reconciler::{ReconcileResult, ReconcilerState, TwoPhaseReconciler};
use crate::service::hotplug;
use crate::store::{ObjectKey, StoreError};

pub use lifecycle::LifecycleHandler;
pub use ready::{BlockDeviceReadyHandler, VirtualMachineReadyHandler};

/// Requeue delay while the device or the VM is not ready.
const WAIT_REQUEUE: Duration = Duration::from_secs(2);

type Attachment = VirtualMachineBlockDeviceAttachment;

fn device_kind(vmbda: &Attachment) -> BlockDeviceKind {
    vmbda.spec.block_device_ref.kind.into()
}

/// KubeVirt volume of the attached device.
fn volume_name(vmbda: &Attachment) -> String {
    hotplug::volume_name(device_kind(vmbda), &vmbda.spec.block_device_ref.name)
}

fn namespace(vmbda: &Attachment) -> &str {
    vmbda.metadata.namespace.as_deref().unwrap_or_default()
}

fn status_mut(vmbda: &mut Attachment) -> &mut VirtualMachineBlockDeviceAttachmentStatus {
    vmbda.status.get_or_insert_with(Default::default)
}

fn conditions(vmbda: &Attachment) -> &[Condition] {
    vmbda.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default()
}

fn condition_is_true(vmbda: &Attachment, type_: &str) -> bool {
    find_condition(conditions(vmbda), type_).is_some_and(Condition::is_true)
}

async fn target_vm(ctx: &Context, vmbda: &Attachment) -> Result<Option<VirtualMachine>, StoreError> {
    ctx.store
        .get(Some(namespace(vmbda)), &vmbda.spec.virtual_machine_name)
        .await
}

/// State of one attachment reconcile.
#[derive(Debug)]
pub struct VmbdaState {
    resource: Resource<Attachment>,
}

#[async_trait]
impl ReconcilerState for VmbdaState {
    async fn reload(&mut self) -> Result<(), ControllerError> {
        self.resource.fetch().await?;
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
        Ok(())
    }
}

/// Reconciles VirtualMachineBlockDeviceAttachments.
#[derive(Debug)]
pub struct VmbdaReconciler {
    ctx: Arc<Context>,
    chain: Chain<Attachment>,
}

impl VmbdaReconciler {
    /// Creates the reconciler.
    pub fn new(ctx: Arc<Context>) -> Self {
        let chain = Chain::new()
            .with(BlockDeviceReadyHandler::new(Arc::clone(&ctx)))
            .with(VirtualMachineReadyHandler::new(Arc::clone(&ctx)))
            .with(LifecycleHandler::new(Arc::clone(&ctx)));
        Self { ctx, chain }
    }
}

#[async_trait]
impl TwoPhaseReconciler for VmbdaReconciler {
    type State = VmbdaState;

    fn new_state(&self, key: &ObjectKey) -> Self::State {
        VmbdaState {
            resource: Resource::new(key.clone(), self.ctx.store.clone()),
        }
    }

    async fn sync(&self, state: &mut Self::State) -> Result<ReconcileResult, ControllerError> {
        let key = state.resource.key().clone();
        let Some(vmbda) = state.resource.changed_mut() else {
            return Ok(ReconcileResult::done());
        };
        info!("Reconciling VirtualMachineBlockDeviceAttachment {}", key);
        self.chain.run(vmbda).await
    }

    async fn update_status(&self, _state: &mut Self::State) -> Result<ReconcileResult, ControllerError> {
        Ok(ReconcileResult::done())
    }
}
