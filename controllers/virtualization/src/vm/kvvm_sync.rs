//! Applies the VM spec to the KubeVirt VirtualMachine.
//!
//! The KubeVirt VM is created once the IP address and all block devices are
//! ready. Afterwards the spec recorded in its last-applied annotation is
//! compared with the current one: changes are applied right away when they
//! need no restart, when restarts are approved automatically, or when the
//! guest is not running. Anything else waits in `status.pendingChanges` for
//! the user to restart the VM.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use tracing::{debug, info, warn};

use crds::annotations::ANN_VM_LAST_APPLIED_SPEC;
use crds::conditions::vm::{ConditionType, Reason};
use crds::conditions::{ConditionBuilder, ConditionStatus, find_condition, set_condition};
use crds::{RestartApprovalMode, VirtualMachineSpec};

use super::{Machine, kvvm, propagation};
use crate::context::Context;
use crate::error::ControllerError;
use crate::meta;
use crate::reconciler::ReconcileResult;
use crate::reconciler::chain::{Handler, HandlerOutcome};
use crate::service::recorder::{object_ref, reasons};
use crate::store::ObjectKey;
use crate::vmchange::{ActionType, SpecChanges, compare_specs, load_last_applied_spec};

/// Requeue delay while the KubeVirt VM waits for dependencies.
const WAITING_REQUEUE: Duration = Duration::from_secs(60);

/// Creates and updates the KubeVirt VirtualMachine.
#[derive(Debug)]
pub struct KvvmSyncHandler {
    ctx: Arc<Context>,
}

impl KvvmSyncHandler {
    /// Creates the handler.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

fn condition_is_true(m: &Machine, type_: ConditionType) -> bool {
    find_condition(m.conditions(), type_.as_str()).is_some_and(|c| c.is_true())
}

fn set_configuration(m: &mut Machine, applied: ConditionStatus, reason: Reason, message: &str) {
    let condition = ConditionBuilder::new(ConditionType::ConfigurationApplied)
        .generation(meta::generation(&m.vm))
        .status(applied)
        .reason(reason)
        .message(message)
        .build();
    set_condition(m.conditions_mut(), condition);
}

fn set_awaiting_restart(m: &mut Machine, awaiting: bool, message: &str) {
    let (status, reason) = if awaiting {
        (ConditionStatus::True, Reason::RestartAwaitingChangesExist)
    } else {
        (ConditionStatus::False, Reason::RestartNoNeed)
    };
    let condition = ConditionBuilder::new(ConditionType::AwaitingRestartToApplyConfiguration)
        .generation(meta::generation(&m.vm))
        .status(status)
        .reason(reason)
        .message(message)
        .build();
    set_condition(m.conditions_mut(), condition);
}

fn clear_pending_changes(m: &mut Machine) {
    let status = m.status_mut();
    status.pending_changes.clear();
    status.change_id.clear();
}

impl KvvmSyncHandler {
    /// Spec last applied to the KubeVirt VM; an empty spec when the annotation is missing or broken.
    async fn last_applied_spec(&self, m: &Machine, raw: Option<&str>) -> VirtualMachineSpec {
        let note = match raw.map(load_last_applied_spec) {
            Some(Ok(spec)) => return spec,
            None => "Could not find last applied spec. Possible old VM or partial backup restore. \
                     Restart or recreate VM to adopt it."
                .to_string(),
            Some(Err(e)) => format!(
                "Could not restore last applied spec: {e}. Possible old VM or partial backup restore. \
                 Restart or recreate VM to adopt it."
            ),
        };
        warn!("{}: {}", ObjectKey::of(&m.vm), note);
        self.ctx
            .recorder
            .publish(&object_ref(&m.vm), EventType::Warning, reasons::VM_LAST_APPLIED_SPEC_INVALID, note)
            .await;
        VirtualMachineSpec::default()
    }

    async fn create(&self, m: &mut Machine) -> Result<(), ControllerError> {
        let ip_address = m.vm.status.as_ref().map(|s| s.ip_address.clone()).unwrap_or_default();
        let mut desired = kvvm::build(&m.vm, None, &m.devices, &ip_address)?;
        propagation::propagate(&m.vm, &mut desired)?;
        info!("Creating KubeVirt VirtualMachine {}", ObjectKey::of(&desired));
        m.kvvm = Some(self.ctx.store.create(&desired).await?);
        Ok(())
    }

    /// Rewrites the KubeVirt VM from the current spec.
    async fn update(&self, m: &mut Machine) -> Result<(), ControllerError> {
        let ip_address = m.vm.status.as_ref().map(|s| s.ip_address.clone()).unwrap_or_default();
        let desired = kvvm::build(&m.vm, m.kvvm.as_ref(), &m.devices, &ip_address)?;
        m.kvvm = Some(self.ctx.store.update(&desired).await?);
        Ok(())
    }

    /// Records the current spec as applied without touching anything else.
    async fn update_last_applied(&self, m: &mut Machine) -> Result<(), ControllerError> {
        let Some(mut current) = m.kvvm.clone() else {
            return Ok(());
        };
        meta::set_annotation(&mut current, ANN_VM_LAST_APPLIED_SPEC, &serde_json::to_string(&m.vm.spec)?);
        m.kvvm = Some(self.ctx.store.update(&current).await?);
        Ok(())
    }

    async fn apply(&self, m: &mut Machine, changes: &SpecChanges) -> Result<(), ControllerError> {
        let mut action = changes.action_type();
        if m.kvvmi.is_none() && action == ActionType::Restart {
            action = ActionType::ApplyImmediate;
        }
        let key = ObjectKey::of(&m.vm);
        let vm_ref = object_ref(&m.vm);

        match action {
            ActionType::Restart => {
                info!("Restarting {} to apply changes", key);
                self.ctx
                    .recorder
                    .publish(&vm_ref, EventType::Normal, reasons::VM_CHANGES_APPLIED, "Apply disruptive changes".to_string())
                    .await;
                self.update(m).await?;
                // KubeVirt starts a new instance from the updated template.
                if let Some(kvvmi) = m.kvvmi.take() {
                    self.ctx.store.delete_object(&kvvmi).await?;
                }
            }
            ActionType::ApplyImmediate | ActionType::SubresourceSignal => {
                let message = if changes.is_disruptive() {
                    "Apply disruptive changes without restart"
                } else {
                    "Apply changes without restart"
                };
                info!("{} to {}", message, key);
                self.ctx
                    .recorder
                    .publish(&vm_ref, EventType::Normal, reasons::VM_CHANGES_APPLIED, message.to_string())
                    .await;
                self.update(m).await?;
            }
            ActionType::None => {
                debug!("No changes to the KubeVirt VirtualMachine of {}, updating last applied spec", key);
                self.update_last_applied(m).await?;
            }
        }
        Ok(())
    }

    async fn sync_existing(&self, m: &mut Machine) -> Result<(), ControllerError> {
        let raw = m
            .kvvm
            .as_ref()
            .and_then(|k| meta::annotation(k, ANN_VM_LAST_APPLIED_SPEC))
            .map(str::to_string);
        let last_applied = self.last_applied_spec(m, raw.as_deref()).await;
        let changes = compare_specs(&last_applied, &m.vm.spec);
        debug!(
            "Changes of {}: empty {}, disruptive {}, action {:?}",
            ObjectKey::of(&m.vm),
            changes.is_empty(),
            changes.is_disruptive(),
            changes.action_type()
        );

        let running = m.kvvmi.as_ref().is_some_and(|i| i.is_running());
        let can_apply = !changes.is_empty()
            && (m.vm.restart_approval_mode() == RestartApprovalMode::Automatic
                || !changes.is_disruptive()
                || !running);

        if can_apply {
            if let Err(e) = self.apply(m, &changes).await {
                let message = format!("Failed to apply configuration changes: {e}");
                set_configuration(m, ConditionStatus::False, Reason::ConfigurationNotApplied, &message);
                return Err(e);
            }
            clear_pending_changes(m);
            set_configuration(m, ConditionStatus::True, Reason::ConfigurationApplied, "");
            set_awaiting_restart(m, false, "");
            return Ok(());
        }

        if !changes.is_empty() {
            let change_id = changes.change_id()?;
            let pending = changes.pending_changes()?;
            let status = m.status_mut();
            let is_new = status.change_id != change_id;
            status.change_id = change_id;
            status.pending_changes = pending;
            set_awaiting_restart(m, true, "");
            set_configuration(m, ConditionStatus::False, Reason::ConfigurationNotApplied, "Waiting for restart from user.");
            if is_new {
                self.ctx
                    .recorder
                    .publish(
                        &object_ref(&m.vm),
                        EventType::Normal,
                        reasons::RESTART_REQUIRED,
                        "Spec changes wait for the virtual machine restart".to_string(),
                    )
                    .await;
            }
            return Ok(());
        }

        clear_pending_changes(m);
        set_configuration(m, ConditionStatus::True, Reason::ConfigurationApplied, "");
        set_awaiting_restart(m, false, "");
        Ok(())
    }

    async fn propagate(&self, m: &mut Machine) -> Result<(), ControllerError> {
        let Some(mut kvvm) = m.kvvm.clone() else {
            return Ok(());
        };
        if propagation::propagate(&m.vm, &mut kvvm)? {
            debug!("Propagating metadata of {}", ObjectKey::of(&m.vm));
            m.kvvm = Some(self.ctx.store.update(&kvvm).await?);
        }
        Ok(())
    }
}

#[async_trait]
impl Handler<Machine> for KvvmSyncHandler {
    fn name(&self) -> &'static str {
        "kvvm-sync"
    }

    async fn handle(&self, m: &mut Machine) -> Result<HandlerOutcome, ControllerError> {
        if meta::is_deleting(&m.vm) {
            return Ok(HandlerOutcome::proceed());
        }

        let waiting = !condition_is_true(m, ConditionType::BlockDevicesReady)
            || !condition_is_true(m, ConditionType::IPAddressReady);
        if waiting {
            set_configuration(
                m,
                ConditionStatus::False,
                Reason::ConfigurationNotApplied,
                "Waiting for dependent resources. Afterwards, configuration may be applied.",
            );
            set_awaiting_restart(m, false, "Waiting for dependent resources.");
            return Ok(HandlerOutcome::Continue(ReconcileResult::requeue_after(WAITING_REQUEUE)));
        }

        if m.kvvm.is_none() {
            if let Err(e) = self.create(m).await {
                let message = format!("Failed to apply configuration: {e}");
                set_configuration(m, ConditionStatus::False, Reason::ConfigurationNotApplied, &message);
                return Err(e);
            }
            clear_pending_changes(m);
            set_configuration(m, ConditionStatus::True, Reason::ConfigurationApplied, "");
            set_awaiting_restart(m, false, "");
            return Ok(HandlerOutcome::proceed());
        }

        self.sync_existing(m).await?;
        self.propagate(m).await?;
        Ok(HandlerOutcome::proceed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_kvvmi, create_test_vm, test_context};
    use crds::kubevirt::{KubeVirtVirtualMachine, KubeVirtVirtualMachineInstance};
    use crds::{Disruptions, VirtualMachine};

    fn ready_vm() -> VirtualMachine {
        let mut vm = create_test_vm("web", "default");
        let mut conditions = Vec::new();
        for type_ in [ConditionType::BlockDevicesReady, ConditionType::IPAddressReady] {
            set_condition(
                &mut conditions,
                ConditionBuilder::new(type_).generation(1).status(ConditionStatus::True).build(),
            );
        }
        vm.status = Some(crds::VirtualMachineStatus {
            conditions,
            ..Default::default()
        });
        vm
    }

    async fn created(ctx: &Arc<Context>, vm: VirtualMachine) -> Machine {
        let mut m = Machine::new(vm, None, None);
        KvvmSyncHandler::new(Arc::clone(ctx)).handle(&mut m).await.unwrap();
        assert!(m.kvvm.is_some());
        m
    }

    fn condition(m: &Machine, type_: ConditionType) -> crds::conditions::Condition {
        find_condition(m.conditions(), type_.as_str()).unwrap().clone()
    }

    #[tokio::test]
    async fn test_waits_for_dependencies() {
        let (ctx, _, _) = test_context();
        let mut m = Machine::new(create_test_vm("web", "default"), None, None);

        let outcome = KvvmSyncHandler::new(ctx).handle(&mut m).await.unwrap();

        assert_eq!(outcome, HandlerOutcome::Continue(ReconcileResult::requeue_after(WAITING_REQUEUE)));
        assert!(m.kvvm.is_none());
        let applied = condition(&m, ConditionType::ConfigurationApplied);
        assert_eq!(applied.status, ConditionStatus::False);
        assert!(applied.message.starts_with("Waiting for dependent resources"));
    }

    #[tokio::test]
    async fn test_creates_kvvm() {
        let (ctx, _, _) = test_context();

        let m = created(&ctx, ready_vm()).await;

        let stored: KubeVirtVirtualMachine = ctx.store.get(Some("default"), "web").await.unwrap().unwrap();
        assert_eq!(stored.spec.template.spec.domain.cpu.cores, 1);
        assert!(condition(&m, ConditionType::ConfigurationApplied).is_true());
        assert_eq!(condition(&m, ConditionType::AwaitingRestartToApplyConfiguration).reason, "RestartNoNeed");
    }

    #[tokio::test]
    async fn test_disruptive_change_waits_for_restart() {
        let (ctx, backend, recorder) = test_context();
        let mut m = created(&ctx, ready_vm()).await;
        let kvvmi = create_test_kvvmi("web", "default", "Running");
        backend.seed(&kvvmi);
        m.kvvmi = Some(kvvmi);
        m.vm.spec.cpu.cores = 4;

        KvvmSyncHandler::new(Arc::clone(&ctx)).handle(&mut m).await.unwrap();

        assert!(condition(&m, ConditionType::AwaitingRestartToApplyConfiguration).is_true());
        assert_eq!(
            condition(&m, ConditionType::ConfigurationApplied).message,
            "Waiting for restart from user."
        );
        let status = m.vm.status.as_ref().unwrap();
        assert!(!status.pending_changes.is_empty());
        assert_ne!(status.change_id, "");
        assert!(recorder.events().iter().any(|(reason, _)| reason == reasons::RESTART_REQUIRED));
        let stored: KubeVirtVirtualMachine = ctx.store.get(Some("default"), "web").await.unwrap().unwrap();
        assert_eq!(stored.spec.template.spec.domain.cpu.cores, 1);
    }

    #[tokio::test]
    async fn test_automatic_approval_restarts_guest() {
        let (ctx, backend, _) = test_context();
        let mut vm = ready_vm();
        vm.spec.disruptions = Some(Disruptions {
            restart_approval_mode: Some(RestartApprovalMode::Automatic),
        });
        let mut m = created(&ctx, vm).await;
        let kvvmi = create_test_kvvmi("web", "default", "Running");
        backend.seed(&kvvmi);
        m.kvvmi = Some(kvvmi);
        m.vm.spec.cpu.cores = 4;

        KvvmSyncHandler::new(Arc::clone(&ctx)).handle(&mut m).await.unwrap();

        assert!(condition(&m, ConditionType::ConfigurationApplied).is_true());
        assert!(m.kvvmi.is_none());
        let stored: KubeVirtVirtualMachine = ctx.store.get(Some("default"), "web").await.unwrap().unwrap();
        assert_eq!(stored.spec.template.spec.domain.cpu.cores, 4);
        let instance: Option<KubeVirtVirtualMachineInstance> = ctx.store.get(Some("default"), "web").await.unwrap();
        assert!(instance.is_none());
    }

    #[tokio::test]
    async fn test_stopped_vm_gets_changes_immediately() {
        let (ctx, _, _) = test_context();
        let mut m = created(&ctx, ready_vm()).await;
        m.vm.spec.cpu.cores = 2;

        KvvmSyncHandler::new(Arc::clone(&ctx)).handle(&mut m).await.unwrap();

        assert!(condition(&m, ConditionType::ConfigurationApplied).is_true());
        assert!(m.vm.status.as_ref().unwrap().pending_changes.is_empty());
        let stored: KubeVirtVirtualMachine = ctx.store.get(Some("default"), "web").await.unwrap().unwrap();
        assert_eq!(stored.spec.template.spec.domain.cpu.cores, 2);
    }

    #[tokio::test]
    async fn test_missing_last_applied_spec_is_reported() {
        let (ctx, _, recorder) = test_context();
        let mut m = created(&ctx, ready_vm()).await;
        if let Some(kvvm) = m.kvvm.as_mut() {
            kvvm.metadata.annotations.as_mut().unwrap().remove(ANN_VM_LAST_APPLIED_SPEC);
        }

        KvvmSyncHandler::new(Arc::clone(&ctx)).handle(&mut m).await.unwrap();

        assert!(
            recorder
                .events()
                .iter()
                .any(|(reason, _)| reason == reasons::VM_LAST_APPLIED_SPEC_INVALID)
        );
    }
}
