//! `BlockDeviceReady` and `VirtualMachineReady` conditions of an attachment.

use std::sync::Arc;

use async_trait::async_trait;

use crds::MachinePhase;
use crds::conditions::vmbda::{ConditionType, Reason};
use crds::conditions::{ConditionBuilder, ConditionStatus, set_condition};

use super::{Attachment, device_kind, namespace, status_mut, target_vm};
use crate::context::Context;
use crate::error::ControllerError;
use crate::meta;
use crate::reconciler::chain::{Handler, HandlerOutcome};
use crate::service::block_device;

/// Tracks whether the device can be hotplugged.
#[derive(Debug)]
pub struct BlockDeviceReadyHandler {
    ctx: Arc<Context>,
}

impl BlockDeviceReadyHandler {
    /// Creates the handler.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler<Attachment> for BlockDeviceReadyHandler {
    fn name(&self) -> &'static str {
        "block-device-ready"
    }

    async fn handle(&self, vmbda: &mut Attachment) -> Result<HandlerOutcome, ControllerError> {
        let cb = ConditionBuilder::new(ConditionType::BlockDeviceReady).generation(meta::generation(vmbda));
        if meta::is_deleting(vmbda) {
            set_condition(&mut status_mut(vmbda).conditions, cb.build());
            return Ok(HandlerOutcome::proceed());
        }

        let kind = device_kind(vmbda);
        let name = vmbda.spec.block_device_ref.name.clone();
        let info = block_device::resolve(&self.ctx.store, kind, namespace(vmbda), &name).await?;
        let not_ready = cb.clone().status(ConditionStatus::False).reason(Reason::BlockDeviceNotReady);
        let condition = match info {
            None => not_ready.message(format!("{kind} {name:?} not found.")).build(),
            Some(info) if !info.ready => not_ready
                .message(format!(
                    "{kind} {name:?} is not ready to be attached to the virtual machine: \
                     waiting for the {kind} to be ready for attachment."
                ))
                .build(),
            Some(info) if info.pvc_name.is_empty() && info.image.is_empty() => not_ready
                .message(format!("Waiting until {kind} {name:?} has associated PersistentVolumeClaim or image."))
                .build(),
            Some(_) => cb
                .status(ConditionStatus::True)
                .reason(Reason::BlockDeviceReady)
                .clear_message()
                .build(),
        };
        set_condition(&mut status_mut(vmbda).conditions, condition);
        Ok(HandlerOutcome::proceed())
    }
}

/// Tracks whether the target VM can take a hotplugged device.
#[derive(Debug)]
pub struct VirtualMachineReadyHandler {
    ctx: Arc<Context>,
}

impl VirtualMachineReadyHandler {
    /// Creates the handler.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Handler<Attachment> for VirtualMachineReadyHandler {
    fn name(&self) -> &'static str {
        "virtual-machine-ready"
    }

    async fn handle(&self, vmbda: &mut Attachment) -> Result<HandlerOutcome, ControllerError> {
        let cb = ConditionBuilder::new(ConditionType::VirtualMachineReady).generation(meta::generation(vmbda));
        if meta::is_deleting(vmbda) {
            set_condition(&mut status_mut(vmbda).conditions, cb.build());
            return Ok(HandlerOutcome::proceed());
        }

        let vm_name = vmbda.spec.virtual_machine_name.clone();
        let vm = target_vm(&self.ctx, vmbda).await?;
        let not_ready = cb.clone().status(ConditionStatus::False).reason(Reason::VirtualMachineNotReady);
        let condition = match vm {
            None => not_ready.message(format!("VirtualMachine {vm_name:?} not found.")).build(),
            Some(vm) if meta::is_deleting(&vm) => not_ready
                .message(format!("VirtualMachine {vm_name:?} is being deleted."))
                .build(),
            Some(vm) if vm.status.as_ref().is_none_or(|s| s.phase != MachinePhase::Running) => not_ready
                .message(format!("Waiting for the VirtualMachine {vm_name:?} to be running."))
                .build(),
            Some(_) => cb
                .status(ConditionStatus::True)
                .reason(Reason::VirtualMachineReady)
                .clear_message()
                .build(),
        };
        set_condition(&mut status_mut(vmbda).conditions, condition);
        Ok(HandlerOutcome::proceed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provisionable::{Phase, Provisionable};
    use crate::test_utils::{create_test_vd, create_test_vm, test_context};
    use crate::vmbda::tests::create_test_vmbda;
    use crds::conditions::find_condition;
    use crds::{DiskStatusTarget, VirtualMachineStatus};

    fn condition(vmbda: &Attachment, type_: ConditionType) -> crds::conditions::Condition {
        find_condition(&vmbda.status.as_ref().unwrap().conditions, type_.as_str())
            .unwrap()
            .clone()
    }

    #[tokio::test]
    async fn test_missing_disk_is_not_ready() {
        let (ctx, _, _) = test_context();
        let mut vmbda = create_test_vmbda("attach", "web", "data");

        BlockDeviceReadyHandler::new(ctx).handle(&mut vmbda).await.unwrap();

        let c = condition(&vmbda, ConditionType::BlockDeviceReady);
        assert_eq!(c.reason, "BlockDeviceNotReady");
        assert!(c.message.contains("not found"));
    }

    #[tokio::test]
    async fn test_ready_disk_with_pvc() {
        let (ctx, backend, _) = test_context();
        let mut vd = create_test_vd("data", "default");
        vd.set_phase(Phase::Ready);
        vd.status.get_or_insert_with(Default::default).target = DiskStatusTarget {
            pvc_name: "d8v-vd-data".to_string(),
        };
        backend.seed(&vd);
        let mut vmbda = create_test_vmbda("attach", "web", "data");

        BlockDeviceReadyHandler::new(ctx).handle(&mut vmbda).await.unwrap();

        assert!(condition(&vmbda, ConditionType::BlockDeviceReady).is_true());
    }

    #[tokio::test]
    async fn test_stopped_vm_is_not_ready() {
        let (ctx, backend, _) = test_context();
        let mut vm = create_test_vm("web", "default");
        vm.status = Some(VirtualMachineStatus {
            phase: MachinePhase::Stopped,
            ..Default::default()
        });
        backend.seed(&vm);
        let mut vmbda = create_test_vmbda("attach", "web", "data");

        VirtualMachineReadyHandler::new(ctx).handle(&mut vmbda).await.unwrap();

        let c = condition(&vmbda, ConditionType::VirtualMachineReady);
        assert_eq!(c.reason, "VirtualMachineNotReady");
        assert!(c.message.contains("to be running"));
    }
}
