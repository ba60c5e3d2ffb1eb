//! `BlockDevicesReady` condition and `status.blockDeviceRefs`.

use std::sync::Arc;

use async_trait::async_trait;

use crds::conditions::vm::{ConditionType, Reason};
use crds::conditions::{ConditionBuilder, ConditionStatus, set_condition};
use crds::kubevirt::KubeVirtVirtualMachineInstance;
use crds::BlockDeviceStatusRef;

use super::{DEPENDENCY_REQUEUE, Machine, ResolvedDevice};
use crate::context::Context;
use crate::error::ControllerError;
use crate::meta;
use crate::reconciler::ReconcileResult;
use crate::reconciler::chain::{Handler, HandlerOutcome};
use crate::service::block_device;
use crate::service::hotplug::{is_attached, volume_name};

/// Resolves the block devices of the VM spec.
#[derive(Debug)]
pub struct BlockDevicesHandler {
    ctx: Arc<Context>,
}

impl BlockDevicesHandler {
    /// Creates the handler.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

/// Device name of the volume inside the guest.
fn volume_target(kvvmi: Option<&KubeVirtVirtualMachineInstance>, volume: &str) -> String {
    kvvmi
        .and_then(|i| i.status.as_ref())
        .and_then(|s| s.volume_status.iter().find(|v| v.name == volume))
        .map(|v| v.target.clone())
        .unwrap_or_default()
}

#[async_trait]
impl Handler<Machine> for BlockDevicesHandler {
    fn name(&self) -> &'static str {
        "block-devices"
    }

    async fn handle(&self, m: &mut Machine) -> Result<HandlerOutcome, ControllerError> {
        if meta::is_deleting(&m.vm) {
            return Ok(HandlerOutcome::proceed());
        }

        let namespace = m.namespace().to_string();
        let mut refs = Vec::new();
        let mut devices = Vec::new();
        let mut not_ready = Vec::new();
        for r in &m.vm.spec.block_device_refs {
            let volume = volume_name(r.kind, &r.name);
            let info = block_device::resolve(&self.ctx.store, r.kind, &namespace, &r.name).await?;
            let ready = info.as_ref().is_some_and(|i| i.ready);
            if !ready {
                not_ready.push(format!("{} {}", r.kind, r.name));
            }
            refs.push(BlockDeviceStatusRef {
                kind: r.kind,
                name: r.name.clone(),
                size: info.as_ref().map(|i| i.size.clone()).unwrap_or_default(),
                target: volume_target(m.kvvmi.as_ref(), &volume),
                attached: is_attached(m.kvvmi.as_ref(), &volume),
                hotplugged: false,
                virtual_machine_block_device_attachment_name: String::new(),
            });
            if let Some(info) = info {
                devices.push(ResolvedDevice {
                    volume_name: volume,
                    info,
                });
            }
        }

        // Hotplugged devices belong to their attachments.
        let spec = &m.vm.spec.block_device_refs;
        let hotplugged: Vec<BlockDeviceStatusRef> = m
            .vm
            .status
            .iter()
            .flat_map(|s| s.block_device_refs.iter())
            .filter(|r| r.hotplugged && !spec.iter().any(|s| s.kind == r.kind && s.name == r.name))
            .cloned()
            .collect();
        refs.extend(hotplugged);
        m.status_mut().block_device_refs = refs;
        m.devices = devices;

        let cb = ConditionBuilder::new(ConditionType::BlockDevicesReady).generation(meta::generation(&m.vm));
        if not_ready.is_empty() {
            let condition = cb
                .status(ConditionStatus::True)
                .reason(Reason::BlockDevicesReady)
                .clear_message()
                .build();
            set_condition(m.conditions_mut(), condition);
            return Ok(HandlerOutcome::proceed());
        }

        let condition = cb
            .status(ConditionStatus::False)
            .reason(Reason::BlockDevicesNotReady)
            .message(format!("Waiting for block devices to be ready: {}", not_ready.join(", ")))
            .build();
        set_condition(m.conditions_mut(), condition);
        Ok(HandlerOutcome::Continue(ReconcileResult::requeue_after(DEPENDENCY_REQUEUE)))
    }
}
