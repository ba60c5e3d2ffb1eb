//! Hotplug state machine of an attachment.

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use tracing::{debug, info};

use crds::annotations::FINALIZER_VMBDA_CLEANUP;
use crds::conditions::vm::ConditionType as VmConditionType;
use crds::conditions::vmbda::{ConditionType, Reason};
use crds::conditions::{ConditionBuilder, ConditionStatus, find_condition, set_condition};
use crds::kubevirt::{KubeVirtVirtualMachine, KubeVirtVirtualMachineInstance};
use crds::{BlockDeviceAttachmentPhase, BlockDeviceStatusRef, VirtualMachine};

use super::{Attachment, WAIT_REQUEUE, condition_is_true, device_kind, namespace, status_mut, target_vm, volume_name};
use crate::context::Context;
use crate::error::ControllerError;
use crate::meta;
use crate::reconciler::ReconcileResult;
use crate::reconciler::chain::{Handler, HandlerOutcome};
use crate::service::block_device;
use crate::service::hotplug::{is_add_requested, is_attached, is_in_template};
use crate::service::recorder::{object_ref, reasons};
use crate::store::ObjectKey;

/// Hotplugs the device and detaches it on deletion.
#[derive(Debug)]
pub struct LifecycleHandler {
    ctx: Arc<Context>,
}

impl LifecycleHandler {
    /// Creates the handler.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

fn set_attached(vmbda: &mut Attachment, phase: BlockDeviceAttachmentPhase, status: ConditionStatus, reason: Reason, message: &str) {
    let condition = ConditionBuilder::new(ConditionType::Attached)
        .generation(meta::generation(vmbda))
        .status(status)
        .reason(reason)
        .message(message)
        .build();
    let generation = meta::generation(vmbda);
    let s = status_mut(vmbda);
    s.phase = phase;
    s.observed_generation = generation;
    set_condition(&mut s.conditions, condition);
}

fn pending(vmbda: &mut Attachment, message: &str) -> HandlerOutcome {
    set_attached(
        vmbda,
        BlockDeviceAttachmentPhase::Pending,
        ConditionStatus::False,
        Reason::NotAttached,
        message,
    );
    HandlerOutcome::Continue(ReconcileResult::requeue_after(WAIT_REQUEUE))
}

fn same_device(r: &BlockDeviceStatusRef, vmbda: &Attachment) -> bool {
    r.kind == device_kind(vmbda) && r.name == vmbda.spec.block_device_ref.name
}

impl LifecycleHandler {
    /// Another live attachment of the same device that takes precedence over this one.
    async fn conflicting(&self, vmbda: &Attachment) -> Result<Option<String>, ControllerError> {
        // Images may be attached to many VMs at once.
        if device_kind(vmbda) != crds::BlockDeviceKind::VirtualDisk {
            return Ok(None);
        }
        let name = vmbda.metadata.name.clone().unwrap_or_default();
        let created = vmbda.metadata.creation_timestamp.as_ref().and_then(meta::to_utc);
        let others: Vec<Attachment> = self.ctx.store.list(Some(namespace(vmbda))).await?;
        for other in others {
            let other_name = other.metadata.name.clone().unwrap_or_default();
            if other_name == name || other.spec.block_device_ref != vmbda.spec.block_device_ref {
                continue;
            }
            let other_phase = other.status.as_ref().map(|s| s.phase);
            if other_phase.is_some_and(|p| p != BlockDeviceAttachmentPhase::Failed) {
                return Ok(Some(other_name));
            }
            let other_created = other.metadata.creation_timestamp.as_ref().and_then(meta::to_utc);
            let earlier = match (other_created, created) {
                (Some(a), Some(b)) if a != b => a < b,
                _ => other_name < name,
            };
            if earlier {
                return Ok(Some(other_name));
            }
        }
        Ok(None)
    }

    /// Adds or refreshes the hotplugged device in the VM status.
    async fn record_on_vm(&self, vm: &VirtualMachine, vmbda: &Attachment, attached: bool) -> Result<(), ControllerError> {
        let info = block_device::resolve(&self.ctx.store, device_kind(vmbda), namespace(vmbda), &vmbda.spec.block_device_ref.name)
            .await?
            .unwrap_or_default();
        let entry = BlockDeviceStatusRef {
            kind: device_kind(vmbda),
            name: vmbda.spec.block_device_ref.name.clone(),
            size: info.size,
            target: String::new(),
            attached,
            hotplugged: true,
            virtual_machine_block_device_attachment_name: vmbda.metadata.name.clone().unwrap_or_default(),
        };
        let mut changed = vm.clone();
        let refs = &mut changed.status.get_or_insert_with(Default::default).block_device_refs;
        match refs.iter_mut().find(|r| same_device(r, vmbda)) {
            Some(existing) if existing.hotplugged => {
                existing.attached = attached;
                existing.virtual_machine_block_device_attachment_name = entry.virtual_machine_block_device_attachment_name;
            }
            Some(_) => return Ok(()),
            None => refs.push(entry),
        }
        if changed != *vm {
            self.ctx.store.update_status(vm, &changed).await?;
        }
        Ok(())
    }

    async fn forget_on_vm(&self, vm: &VirtualMachine, vmbda: &Attachment) -> Result<(), ControllerError> {
        let mut changed = vm.clone();
        if let Some(status) = changed.status.as_mut() {
            status.block_device_refs.retain(|r| !(r.hotplugged && same_device(r, vmbda)));
        }
        if changed != *vm {
            self.ctx.store.update_status(vm, &changed).await?;
        }
        Ok(())
    }

    async fn kubevirt_objects(
        &self,
        vm: &VirtualMachine,
    ) -> Result<(Option<KubeVirtVirtualMachine>, Option<KubeVirtVirtualMachineInstance>), ControllerError> {
        let key = ObjectKey::of(vm);
        let namespace = key.namespace.as_deref();
        let kvvm = self.ctx.store.get(namespace, &key.name).await?;
        let kvvmi = self.ctx.store.get(namespace, &key.name).await?;
        Ok((kvvm, kvvmi))
    }

    async fn detach(&self, vmbda: &mut Attachment) -> Result<HandlerOutcome, ControllerError> {
        let phase = vmbda.status.as_ref().map(|s| s.phase).unwrap_or_default();
        let volume = volume_name(vmbda);
        let vm = target_vm(&self.ctx, vmbda).await?;

        if phase != BlockDeviceAttachmentPhase::Failed
            && let Some(vm) = &vm
        {
            let (kvvm, _) = self.kubevirt_objects(vm).await?;
            if let Some(kvvm) = kvvm {
                let detached = self.ctx.hotplug().unplug(&kvvm, &volume).await?;
                if !detached {
                    debug!("Waiting for {} to be detached from {}", volume, ObjectKey::of(vm));
                    set_attached(
                        vmbda,
                        BlockDeviceAttachmentPhase::Terminating,
                        ConditionStatus::Unknown,
                        Reason::NotAttached,
                        "",
                    );
                    return Ok(HandlerOutcome::Stop(ReconcileResult::requeue_after(WAIT_REQUEUE)));
                }
            }
            self.forget_on_vm(vm, vmbda).await?;
            self.ctx
                .recorder
                .publish(
                    &object_ref(vmbda),
                    EventType::Normal,
                    reasons::DETACHED,
                    format!("Block device {volume} detached from the virtual machine"),
                )
                .await;
        }

        status_mut(vmbda).phase = BlockDeviceAttachmentPhase::Terminating;
        meta::remove_finalizer(vmbda, FINALIZER_VMBDA_CLEANUP);
        Ok(HandlerOutcome::Stop(ReconcileResult::done()))
    }
}

#[async_trait]
impl Handler<Attachment> for LifecycleHandler {
    fn name(&self) -> &'static str {
        "lifecycle"
    }

    async fn handle(&self, vmbda: &mut Attachment) -> Result<HandlerOutcome, ControllerError> {
        if meta::is_deleting(vmbda) {
            return self.detach(vmbda).await;
        }
        meta::add_finalizer(vmbda, FINALIZER_VMBDA_CLEANUP);

        let phase = vmbda.status.as_ref().map(|s| s.phase);
        if phase == Some(BlockDeviceAttachmentPhase::Failed) {
            return Ok(HandlerOutcome::Stop(ReconcileResult::done()));
        }

        if let Some(other) = self.conflicting(vmbda).await? {
            let message = format!(
                "Another VirtualMachineBlockDeviceAttachment {}/{} already exists with the same virtual machine {} \
                 and block device {} for hot-plugging.",
                namespace(vmbda),
                other,
                vmbda.spec.virtual_machine_name,
                vmbda.spec.block_device_ref.name
            );
            set_attached(
                vmbda,
                BlockDeviceAttachmentPhase::Failed,
                ConditionStatus::False,
                Reason::Conflict,
                &message,
            );
            let s = status_mut(vmbda);
            s.failure_reason = Reason::Conflict.to_string();
            s.failure_message = message;
            return Ok(HandlerOutcome::Stop(ReconcileResult::done()));
        }

        if !condition_is_true(vmbda, ConditionType::BlockDeviceReady.as_str()) {
            return Ok(pending(vmbda, "Waiting for block device to be ready."));
        }
        if !condition_is_true(vmbda, ConditionType::VirtualMachineReady.as_str()) {
            return Ok(pending(vmbda, "Waiting for virtual machine to be ready."));
        }

        let Some(vm) = target_vm(&self.ctx, vmbda).await? else {
            let message = format!("VirtualMachine {} not found.", vmbda.spec.virtual_machine_name);
            return Ok(pending(vmbda, &message));
        };
        let (kvvm, kvvmi) = self.kubevirt_objects(&vm).await?;
        let Some(kvvm) = kvvm else {
            let message = format!("InternalVirtualizationVirtualMachine {} not found.", vmbda.spec.virtual_machine_name);
            return Ok(pending(vmbda, &message));
        };
        let Some(kvvmi) = kvvmi.filter(KubeVirtVirtualMachineInstance::is_running) else {
            let message = format!(
                "InternalVirtualizationVirtualMachineInstance {} is not running.",
                vmbda.spec.virtual_machine_name
            );
            return Ok(pending(vmbda, &message));
        };

        let volume = volume_name(vmbda);
        if is_attached(Some(&kvvmi), &volume) {
            let was_attached = phase == Some(BlockDeviceAttachmentPhase::Attached);
            set_attached(vmbda, BlockDeviceAttachmentPhase::Attached, ConditionStatus::True, Reason::Attached, "");
            self.record_on_vm(&vm, vmbda, true).await?;
            if !was_attached {
                info!("Block device {} attached to {}", volume, ObjectKey::of(&vm));
                self.ctx
                    .recorder
                    .publish(
                        &object_ref(vmbda),
                        EventType::Normal,
                        reasons::ATTACHED,
                        format!("Block device {volume} attached to the virtual machine"),
                    )
                    .await;
            }
            return Ok(HandlerOutcome::proceed());
        }

        if is_add_requested(&kvvm, &volume) || is_in_template(&kvvm, &volume) {
            set_attached(
                vmbda,
                BlockDeviceAttachmentPhase::InProgress,
                ConditionStatus::False,
                Reason::AttachmentRequestSent,
                "Attachment request sent: attachment is in progress.",
            );
            return Ok(HandlerOutcome::Continue(ReconcileResult::requeue_after(WAIT_REQUEUE)));
        }

        if vm.spec.block_device_refs.iter().any(|r| r.kind == device_kind(vmbda) && r.name == vmbda.spec.block_device_ref.name) {
            let message = format!(
                "{} {} is already attached to the virtual machine spec.",
                device_kind(vmbda),
                vmbda.spec.block_device_ref.name
            );
            set_attached(vmbda, BlockDeviceAttachmentPhase::Pending, ConditionStatus::False, Reason::NotAttached, &message);
            return Ok(HandlerOutcome::proceed());
        }
        let awaiting_restart = vm
            .status
            .as_ref()
            .and_then(|s| find_condition(&s.conditions, VmConditionType::AwaitingRestartToApplyConfiguration.as_str()))
            .is_some_and(|c| c.is_true());
        if awaiting_restart {
            return Ok(pending(vmbda, "Virtual machine waits for restart approval."));
        }

        let info = block_device::resolve(&self.ctx.store, device_kind(vmbda), namespace(vmbda), &vmbda.spec.block_device_ref.name)
            .await?
            .unwrap_or_default();
        self.ctx.hotplug().hotplug(&kvvm, &info.hotplug_request(volume.clone())).await?;
        self.record_on_vm(&vm, vmbda, false).await?;
        self.ctx
            .recorder
            .publish(
                &object_ref(vmbda),
                EventType::Normal,
                reasons::ATTACHMENT_REQUESTED,
                format!("Hotplug of {volume} requested"),
            )
            .await;
        set_attached(
            vmbda,
            BlockDeviceAttachmentPhase::InProgress,
            ConditionStatus::False,
            Reason::AttachmentRequestSent,
            "Attachment request has sent: attachment is in progress.",
        );
        Ok(HandlerOutcome::Continue(ReconcileResult::requeue_after(WAIT_REQUEUE)))
    }
}
