//! `IPAddressReady` condition: the VM's IP address claim.

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use tracing::{debug, info};

use crds::ClaimPhase;
use crds::conditions::vm::{ConditionType, Reason};
use crds::conditions::{ConditionBuilder, ConditionStatus, set_condition};

use super::{DEPENDENCY_REQUEUE, Machine};
use crate::context::Context;
use crate::error::ControllerError;
use crate::meta;
use crate::reconciler::ReconcileResult;
use crate::reconciler::chain::{Handler, HandlerOutcome};
use crate::service::ipam::{IpamError, bound_vm, claim_name};
use crate::service::recorder::{object_ref, reasons};
use crate::store::StoreError;

/// Creates or binds the IP address claim of the VM.
#[derive(Debug)]
pub struct IpamHandler {
    ctx: Arc<Context>,
}

impl IpamHandler {
    /// Creates the handler.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

fn waiting() -> HandlerOutcome {
    HandlerOutcome::Continue(ReconcileResult::requeue_after(DEPENDENCY_REQUEUE))
}

#[async_trait]
impl Handler<Machine> for IpamHandler {
    fn name(&self) -> &'static str {
        "ipam"
    }

    async fn handle(&self, m: &mut Machine) -> Result<HandlerOutcome, ControllerError> {
        if meta::is_deleting(&m.vm) {
            return Ok(HandlerOutcome::proceed());
        }

        let cb = ConditionBuilder::new(ConditionType::IPAddressReady).generation(meta::generation(&m.vm));
        let ipam = self.ctx.ipam();
        let vm_name = m.name().to_string();
        let claim = ipam.get_claim(&m.vm).await?;

        let Some(claim) = claim else {
            let requested = m.vm.spec.virtual_machine_ip_address.clone();
            let message = if requested.is_empty() {
                info!("IP address claim of {} not found, creating it", vm_name);
                match ipam.create_ip_address_claim(&m.vm).await {
                    Ok(_) | Err(IpamError::Store(StoreError::AlreadyExists(_))) => {}
                    Err(e) => return Err(e.into()),
                }
                format!(
                    "VirtualMachineIPAddressClaim {:?} not found: it may be in the process of being created",
                    claim_name(&m.vm)
                )
            } else {
                format!("The requested ip address ({requested}) for the virtual machine not found: waiting for the ip address")
            };
            let condition = cb
                .status(ConditionStatus::False)
                .reason(Reason::IPAddressNotReady)
                .message(message)
                .build();
            set_condition(m.conditions_mut(), condition);
            return Ok(waiting());
        };

        let phase = claim.status.as_ref().map(|s| s.phase).unwrap_or_default();
        if bound_vm(&claim) == Some(vm_name.as_str()) && phase == ClaimPhase::Bound {
            let address = claim.status.as_ref().map(|s| s.address.clone()).unwrap_or_default();
            let status = m.status_mut();
            status.virtual_machine_ip_address = claim.metadata.name.clone().unwrap_or_default();
            status.ip_address = address;
            let condition = cb
                .status(ConditionStatus::True)
                .reason(Reason::IPAddressReady)
                .clear_message()
                .build();
            set_condition(m.conditions_mut(), condition);
            return Ok(HandlerOutcome::proceed());
        }

        match ipam.bind_ip_address_claim(&m.vm, &claim).await {
            Ok(()) => {
                debug!("Waiting for the IP address claim of {} to be bound", vm_name);
                let condition = cb
                    .status(ConditionStatus::False)
                    .reason(Reason::IPAddressNotReady)
                    .message("Ip address not bound: waiting for the ip address")
                    .build();
                set_condition(m.conditions_mut(), condition);
                Ok(waiting())
            }
            Err(e @ IpamError::ClaimBound { .. }) => {
                let message = e.to_string();
                let condition = cb
                    .status(ConditionStatus::False)
                    .reason(Reason::IPAddressNotAvailable)
                    .message(message.clone())
                    .build();
                set_condition(m.conditions_mut(), condition);
                self.ctx
                    .recorder
                    .publish(&object_ref(&m.vm), EventType::Warning, reasons::IP_ADDRESS_NOT_AVAILABLE, message)
                    .await;
                Ok(HandlerOutcome::proceed())
            }
            Err(e) => Err(e.into()),
        }
    }
}
