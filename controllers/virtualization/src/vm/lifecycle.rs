//! Power state and observed state of the VM.
//!
//! Keeps the KubeVirt run strategy in line with the run policy and copies the
//! state of the KubeVirt objects into the VM status: phase, node, guest OS
//! and the `Running` condition.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crds::conditions::vm::{ConditionType, Reason};
use crds::conditions::{ConditionBuilder, ConditionStatus, set_condition};
use crds::kubevirt::KubeVirtVirtualMachine;
use crds::{GuestOsInfo, MachinePhase, RunPolicy};

use super::{Machine, kvvm};
use crate::context::Context;
use crate::error::ControllerError;
use crate::meta;
use crate::reconciler::ReconcileResult;
use crate::reconciler::chain::{Handler, HandlerOutcome};
use crate::store::ObjectKey;

/// Instance phase of a guest that shut itself down.
const INSTANCE_SUCCEEDED: &str = "Succeeded";
const INSTANCE_FAILED: &str = "Failed";

/// Syncs the power state and the VM phase.
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

/// VM phase for the printable status of the KubeVirt VM.
pub fn machine_phase(kvvm: Option<&KubeVirtVirtualMachine>, current: MachinePhase, policy: RunPolicy) -> MachinePhase {
    let Some(kvvm) = kvvm else {
        return MachinePhase::Pending;
    };
    let printable = kvvm.status.as_ref().map(|s| s.printable_status.as_str()).unwrap_or_default();
    match printable {
        "Stopped" => {
            // Stays pending until the first start of a VM that must run.
            let must_run = matches!(policy, RunPolicy::AlwaysOn | RunPolicy::AlwaysOnUnlessStoppedManually);
            if current == MachinePhase::Pending && must_run {
                MachinePhase::Pending
            } else {
                MachinePhase::Stopped
            }
        }
        "Provisioning" | "Starting" => MachinePhase::Starting,
        "Running" => MachinePhase::Running,
        "Paused" => MachinePhase::Pause,
        "Stopping" => MachinePhase::Stopping,
        "Terminating" => MachinePhase::Terminating,
        "Migrating" => MachinePhase::Migrating,
        "" | "CrashLoopBackOff" | "Unknown" | "ErrorUnschedulable" | "Unschedulable" | "ErrImagePull"
        | "ImagePullBackOff" | "ErrorPvcNotFound" | "PvcNotFound" | "DataVolumeError" | "WaitingForVolumeBinding" => {
            MachinePhase::Pending
        }
        other => {
            warn!("Unexpected KubeVirt VM state {:?}, falling back to Pending", other);
            MachinePhase::Pending
        }
    }
}

impl LifecycleHandler {
    /// Applies the run policy; returns true if the instance was stopped.
    async fn sync_power_state(&self, m: &mut Machine) -> Result<bool, ControllerError> {
        let Some(current) = m.kvvm.clone() else {
            return Ok(false);
        };
        let policy = m.vm.spec.run_policy;
        let instance_phase = m
            .kvvmi
            .as_ref()
            .and_then(|i| i.status.as_ref())
            .map(|s| s.phase.clone())
            .unwrap_or_default();

        let current_strategy = current.spec.run_strategy.clone();
        let mut desired = kvvm::run_strategy(policy, current_strategy.as_deref()).to_string();
        if policy == RunPolicy::AlwaysOnUnlessStoppedManually && instance_phase == INSTANCE_SUCCEEDED {
            // The guest was shut down from inside.
            desired = "Halted".to_string();
        }
        if current_strategy.as_deref() != Some(desired.as_str()) {
            info!("Setting run strategy of {} to {}", ObjectKey::of(&current), desired);
            let mut updated = current;
            updated.spec.run_strategy = Some(desired);
            m.kvvm = Some(self.ctx.store.update(&updated).await?);
        }

        let stop = match policy {
            RunPolicy::AlwaysOff => m.kvvmi.is_some(),
            RunPolicy::Manual | RunPolicy::AlwaysOnUnlessStoppedManually => instance_phase == INSTANCE_SUCCEEDED,
            RunPolicy::AlwaysOn => instance_phase == INSTANCE_FAILED || instance_phase == INSTANCE_SUCCEEDED,
        };
        if !stop {
            return Ok(false);
        }
        if let Some(kvvmi) = m.kvvmi.take() {
            info!("Removing instance {} in phase {:?}", ObjectKey::of(&kvvmi), instance_phase);
            self.ctx.store.delete_object(&kvvmi).await?;
        }
        Ok(true)
    }

    fn sync_status(&self, m: &mut Machine) {
        let current_phase = m.vm.status.as_ref().map(|s| s.phase).unwrap_or_default();
        let phase = machine_phase(m.kvvm.as_ref(), current_phase, m.vm.spec.run_policy);
        let generation = meta::generation(&m.vm);
        let instance = m.kvvmi.as_ref().and_then(|i| i.status.clone());

        let status = m.status_mut();
        status.phase = phase;
        status.observed_generation = generation;
        match &instance {
            Some(instance) => {
                status.node_name = instance.node_name.clone();
                status.guest_os_info = GuestOsInfo {
                    name: instance.guest_os_info.name.clone(),
                    pretty_name: instance.guest_os_info.pretty_name.clone(),
                    version: instance.guest_os_info.version.clone(),
                    kernel_release: instance.guest_os_info.kernel_release.clone(),
                };
                if status.ip_address.is_empty()
                    && let Some(iface) = instance.interfaces.iter().find(|i| !i.ip_address.is_empty())
                {
                    status.ip_address = iface.ip_address.clone();
                }
            }
            None => {
                status.node_name.clear();
                status.guest_os_info = GuestOsInfo::default();
            }
        }

        let cb = ConditionBuilder::new(ConditionType::Running).generation(generation);
        let condition = if instance.is_some() && phase == MachinePhase::Running {
            cb.status(ConditionStatus::True).reason(Reason::VmIsRunning).build()
        } else {
            cb.status(ConditionStatus::False).reason(Reason::VmIsNotRunning).build()
        };
        set_condition(m.conditions_mut(), condition);
    }
}

#[async_trait]
impl Handler<Machine> for LifecycleHandler {
    fn name(&self) -> &'static str {
        "lifecycle"
    }

    async fn handle(&self, m: &mut Machine) -> Result<HandlerOutcome, ControllerError> {
        if meta::is_deleting(&m.vm) {
            let generation = meta::generation(&m.vm);
            let status = m.status_mut();
            status.phase = MachinePhase::Terminating;
            status.observed_generation = generation;
            return Ok(HandlerOutcome::proceed());
        }

        let stopped = self.sync_power_state(m).await?;
        self.sync_status(m);
        if stopped {
            return Ok(HandlerOutcome::Continue(ReconcileResult::requeue()));
        }
        Ok(HandlerOutcome::proceed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_kvvm, create_test_kvvmi, create_test_vm, mark_deleting, test_context};
    use crds::conditions::find_condition;
    use crds::kubevirt::{InstanceInterface, KubeVirtVirtualMachineInstance, KubeVirtVirtualMachineStatus};

    fn kvvm_in(printable: &str) -> KubeVirtVirtualMachine {
        let mut kvvm = create_test_kvvm("web", "default");
        kvvm.status = Some(KubeVirtVirtualMachineStatus {
            printable_status: printable.to_string(),
            ..Default::default()
        });
        kvvm
    }

    #[test]
    fn test_machine_phase_mapping() {
        let policy = RunPolicy::Manual;
        assert_eq!(machine_phase(None, MachinePhase::Running, policy), MachinePhase::Pending);
        assert_eq!(
            machine_phase(Some(&kvvm_in("Provisioning")), MachinePhase::Pending, policy),
            MachinePhase::Starting
        );
        assert_eq!(machine_phase(Some(&kvvm_in("Paused")), MachinePhase::Running, policy), MachinePhase::Pause);
        assert_eq!(
            machine_phase(Some(&kvvm_in("ErrImagePull")), MachinePhase::Starting, policy),
            MachinePhase::Pending
        );
        assert_eq!(machine_phase(Some(&kvvm_in("Bogus")), MachinePhase::Running, policy), MachinePhase::Pending);
    }

    #[test]
    fn test_stopped_vm_that_must_run_stays_pending() {
        let stopped = kvvm_in("Stopped");
        assert_eq!(
            machine_phase(Some(&stopped), MachinePhase::Pending, RunPolicy::AlwaysOn),
            MachinePhase::Pending
        );
        assert_eq!(
            machine_phase(Some(&stopped), MachinePhase::Running, RunPolicy::AlwaysOn),
            MachinePhase::Stopped
        );
        assert_eq!(
            machine_phase(Some(&stopped), MachinePhase::Pending, RunPolicy::Manual),
            MachinePhase::Stopped
        );
    }

    #[tokio::test]
    async fn test_running_instance_fills_status() {
        let (ctx, backend, _) = test_context();
        let mut kvvm = kvvm_in("Running");
        kvvm.spec.run_strategy = Some("Always".to_string());
        backend.seed(&kvvm);
        let kvvm = ctx.store.get(Some("default"), "web").await.unwrap();
        let mut kvvmi = create_test_kvvmi("web", "default", "Running");
        if let Some(status) = kvvmi.status.as_mut() {
            status.node_name = "node-1".to_string();
            status.interfaces.push(InstanceInterface {
                name: "default".to_string(),
                ip_address: "10.66.10.9".to_string(),
            });
        }
        let mut m = Machine::new(create_test_vm("web", "default"), kvvm, Some(kvvmi));

        let outcome = LifecycleHandler::new(ctx).handle(&mut m).await.unwrap();

        assert_eq!(outcome, HandlerOutcome::proceed());
        let status = m.vm.status.as_ref().unwrap();
        assert_eq!(status.phase, MachinePhase::Running);
        assert_eq!(status.node_name, "node-1");
        assert_eq!(status.ip_address, "10.66.10.9");
        assert!(find_condition(&status.conditions, "Running").unwrap().is_true());
    }

    #[tokio::test]
    async fn test_always_off_stops_instance() {
        let (ctx, backend, _) = test_context();
        let mut kvvm = kvvm_in("Running");
        kvvm.spec.run_strategy = Some("Always".to_string());
        backend.seed(&kvvm);
        let kvvmi = create_test_kvvmi("web", "default", "Running");
        backend.seed(&kvvmi);
        let kvvm = ctx.store.get(Some("default"), "web").await.unwrap();
        let mut vm = create_test_vm("web", "default");
        vm.spec.run_policy = RunPolicy::AlwaysOff;
        let mut m = Machine::new(vm, kvvm, Some(kvvmi));

        let outcome = LifecycleHandler::new(Arc::clone(&ctx)).handle(&mut m).await.unwrap();

        assert_eq!(outcome, HandlerOutcome::Continue(ReconcileResult::requeue()));
        assert!(m.kvvmi.is_none());
        let stored: KubeVirtVirtualMachine = ctx.store.get(Some("default"), "web").await.unwrap().unwrap();
        assert_eq!(stored.spec.run_strategy.as_deref(), Some("Halted"));
        let instance: Option<KubeVirtVirtualMachineInstance> = ctx.store.get(Some("default"), "web").await.unwrap();
        assert!(instance.is_none());
        let running = find_condition(m.conditions(), "Running").unwrap().clone();
        assert_eq!(running.reason, "VmIsNotRunning");
    }

    #[tokio::test]
    async fn test_guest_shutdown_halts_vm() {
        let (ctx, backend, _) = test_context();
        let mut kvvm = kvvm_in("Stopped");
        kvvm.spec.run_strategy = Some("Always".to_string());
        backend.seed(&kvvm);
        let kvvmi = create_test_kvvmi("web", "default", "Succeeded");
        backend.seed(&kvvmi);
        let kvvm = ctx.store.get(Some("default"), "web").await.unwrap();
        let mut vm = create_test_vm("web", "default");
        vm.spec.run_policy = RunPolicy::AlwaysOnUnlessStoppedManually;
        let mut m = Machine::new(vm, kvvm, Some(kvvmi));

        LifecycleHandler::new(Arc::clone(&ctx)).handle(&mut m).await.unwrap();

        let stored: KubeVirtVirtualMachine = ctx.store.get(Some("default"), "web").await.unwrap().unwrap();
        assert_eq!(stored.spec.run_strategy.as_deref(), Some("Halted"));
        assert!(m.kvvmi.is_none());
    }

    #[tokio::test]
    async fn test_deleting_vm_is_terminating() {
        let (ctx, _, _) = test_context();
        let mut vm = create_test_vm("web", "default");
        mark_deleting(&mut vm);
        let mut m = Machine::new(vm, None, None);

        LifecycleHandler::new(ctx).handle(&mut m).await.unwrap();

        assert_eq!(m.vm.status.as_ref().unwrap().phase, MachinePhase::Terminating);
    }
}
