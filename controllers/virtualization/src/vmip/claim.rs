//! VirtualMachineIPAddressClaim reconciler.
//!
//! Sync keeps the claim bound to the VM using it and makes sure a lease
//! exists; the status phase is derived from the lease afterwards.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::events::EventType;
use tracing::{debug, info, warn};

use crds::annotations::{ANN_BOUND_VIRTUAL_MACHINE_NAME, FINALIZER_VMIP_CLEANUP, LABEL_IMPLICIT_IP_ADDRESS_CLAIM};
use crds::conditions::vmip::{ClaimConditionType, ClaimReason};
use crds::conditions::{ConditionBuilder, ConditionStatus, set_condition};
use crds::{
    ClaimPhase, LeasePhase, VirtualMachine, VirtualMachineIPAddressClaim, VirtualMachineIPAddressLease,
    VirtualMachineIPAddressLeaseSpec, ip_from_lease_name, lease_name_from_ip,
};

use super::{claim_ref, is_bound_to};
use crate::context::Context;
use crate::error::ControllerError;
use crate::meta;
use crate::reconciler::resource::Resource;
use crate::reconciler::{ReconcileResult, ReconcilerState, TwoPhaseReconciler};
use crate::service::ipam::{IpamError, bound_vm, claim_name};
use crate::service::recorder::{object_ref, reasons};
use crate::store::{ObjectKey, StoreError};

/// Requeue delay while the lease is not reconciled yet.
const LEASE_REQUEUE: Duration = Duration::from_secs(2);

const CONFLICT_MESSAGE: &str = "Lease is bounded to another claim: please recreate claim when the lease is released";

type Claim = VirtualMachineIPAddressClaim;
type Lease = VirtualMachineIPAddressLease;

/// State of one claim reconcile.
#[derive(Debug)]
pub struct ClaimState {
    ctx: Arc<Context>,
    resource: Resource<Claim>,
    lease: Option<Lease>,
    /// Live VMs in the namespace referencing the claim
    users: Vec<String>,
    /// Why an address could not be allocated
    allocation_error: Option<String>,
    deleted: bool,
}

impl ClaimState {
    /// Name of the lease the claim should hold.
    fn lease_name(claim: &Claim) -> Option<String> {
        let status_lease = claim.status.as_ref().map(|s| s.lease.clone()).unwrap_or_default();
        [claim.spec.virtual_machine_ip_address_lease_name.clone(), status_lease]
            .into_iter()
            .find(|n| !n.is_empty())
            .or_else(|| (!claim.spec.address.is_empty()).then(|| lease_name_from_ip(&claim.spec.address)))
    }
}

#[async_trait]
impl ReconcilerState for ClaimState {
    async fn reload(&mut self) -> Result<(), ControllerError> {
        self.resource.fetch().await?;
        let Some(claim) = self.resource.current() else {
            return Ok(());
        };

        self.lease = match Self::lease_name(claim) {
            Some(name) => self.ctx.store.get(None, &name).await?,
            None => None,
        };
        let name = self.resource.key().name.clone();
        let vms: Vec<VirtualMachine> = self.ctx.store.list(self.resource.key().namespace.as_deref()).await?;
        self.users = vms
            .iter()
            .filter(|vm| !meta::is_deleting(*vm) && claim_name(vm) == name)
            .filter_map(|vm| vm.metadata.name.clone())
            .collect();
        Ok(())
    }

    fn should_reconcile(&self) -> bool {
        !self.resource.is_empty()
    }

    async fn apply_sync(&mut self) -> Result<(), ControllerError> {
        if self.deleted {
            return Ok(());
        }
        self.resource.update_meta().await?;
        Ok(())
    }

    async fn apply_update_status(&mut self) -> Result<(), ControllerError> {
        if self.deleted {
            return Ok(());
        }
        self.resource.update_status().await?;
        Ok(())
    }
}

/// Reconciles VirtualMachineIPAddressClaims.
#[derive(Debug)]
pub struct ClaimReconciler {
    ctx: Arc<Context>,
}

impl ClaimReconciler {
    /// Creates the reconciler.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Drops the binding to a VM that no longer uses the claim.
    fn sync_binding(claim: &mut Claim, users: &[String]) {
        if let Some(bound) = bound_vm(claim).map(str::to_string)
            && !users.contains(&bound)
        {
            info!("Unbinding claim {} from {}", ObjectKey::of(claim), bound);
            if let Some(annotations) = claim.metadata.annotations.as_mut() {
                annotations.remove(ANN_BOUND_VIRTUAL_MACHINE_NAME);
            }
        }
        if bound_vm(claim).is_none()
            && let [user] = users
        {
            meta::set_annotation(claim, ANN_BOUND_VIRTUAL_MACHINE_NAME, user);
        }
    }

    async fn create_lease(&self, state: &mut ClaimState) -> Result<ReconcileResult, ControllerError> {
        let Some(claim) = state.resource.changed_mut() else {
            return Ok(ReconcileResult::done());
        };
        let address = match self.ctx.ipam().allocate(&claim.spec.address).await {
            Ok(address) => address.to_string(),
            Err(IpamError::Store(e)) => return Err(e.into()),
            Err(e) => {
                let message = format!("The VirtualMachineIPAddressClaim cannot be bound: {e}.");
                warn!("{}: {}", ObjectKey::of(&*claim), message);
                self.ctx
                    .recorder
                    .publish(&object_ref(&*claim), EventType::Warning, reasons::IP_ADDRESS_NOT_AVAILABLE, message.clone())
                    .await;
                state.allocation_error = Some(message);
                return Ok(ReconcileResult::done());
            }
        };

        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(lease_name_from_ip(&address)),
                ..Default::default()
            },
            spec: VirtualMachineIPAddressLeaseSpec {
                claim_ref: Some(claim_ref(claim)),
                reclaim_policy: claim.spec.reclaim_policy,
            },
            status: None,
        };
        info!("Creating lease {} for claim {}", ObjectKey::of(&lease), ObjectKey::of(&*claim));
        match self.ctx.store.create(&lease).await {
            Ok(created) => {
                claim.status.get_or_insert_with(Default::default).lease = created.metadata.name.clone().unwrap_or_default();
                self.ctx
                    .recorder
                    .publish(
                        &object_ref(&*claim),
                        EventType::Normal,
                        reasons::BOUND,
                        "VirtualMachineIPAddressClaim is bound to a new VirtualMachineIPAddressLease.".to_string(),
                    )
                    .await;
                state.lease = Some(created);
                Ok(ReconcileResult::requeue_after(LEASE_REQUEUE))
            }
            Err(StoreError::AlreadyExists(_)) => {
                warn!("Lease for {} already exists, requeue", address);
                Ok(ReconcileResult::requeue_after(LEASE_REQUEUE))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Takes over a released lease.
    async fn bind_lease(&self, claim: &Claim, lease: &Lease) -> Result<Option<Lease>, ControllerError> {
        let same_namespace = lease
            .spec
            .claim_ref
            .as_ref()
            .is_none_or(|r| Some(r.namespace.as_str()) == claim.metadata.namespace.as_deref());
        if !same_namespace {
            warn!("Lease {} belongs to a different namespace", ObjectKey::of(lease));
            return Ok(None);
        }
        info!("Binding released lease {} to {}", ObjectKey::of(lease), ObjectKey::of(claim));
        let mut bound = lease.clone();
        bound.spec.claim_ref = Some(claim_ref(claim));
        Ok(Some(self.ctx.store.update(&bound).await?))
    }
}

fn bound_condition(claim: &mut Claim, status: ConditionStatus, reason: ClaimReason, message: &str) {
    let condition = ConditionBuilder::new(ClaimConditionType::Bound)
        .generation(meta::generation(claim))
        .status(status)
        .reason(reason)
        .message(message)
        .build();
    set_condition(&mut claim.status.get_or_insert_with(Default::default).conditions, condition);
}

#[async_trait]
impl TwoPhaseReconciler for ClaimReconciler {
    type State = ClaimState;

    fn new_state(&self, key: &ObjectKey) -> Self::State {
        ClaimState {
            ctx: Arc::clone(&self.ctx),
            resource: Resource::new(key.clone(), self.ctx.store.clone()),
            lease: None,
            users: Vec::new(),
            allocation_error: None,
            deleted: false,
        }
    }

    async fn sync(&self, state: &mut Self::State) -> Result<ReconcileResult, ControllerError> {
        let users = state.users.clone();
        let Some(claim) = state.resource.changed_mut() else {
            return Ok(ReconcileResult::done());
        };
        info!("Reconciling VirtualMachineIPAddressClaim {}", ObjectKey::of(&*claim));

        Self::sync_binding(claim, &users);
        if users.is_empty() {
            meta::remove_finalizer(claim, FINALIZER_VMIP_CLEANUP);
            let implicit = meta::label(claim, LABEL_IMPLICIT_IP_ADDRESS_CLAIM) == Some("true");
            if implicit && !meta::is_deleting(claim) {
                info!("Deleting unused implicit claim {}", ObjectKey::of(&*claim));
                let current = claim.clone();
                state.resource.update_meta().await?;
                self.ctx.store.delete_object(&current).await?;
                state.deleted = true;
                return Ok(ReconcileResult::done());
            }
        } else {
            meta::add_finalizer(claim, FINALIZER_VMIP_CLEANUP);
        }
        if meta::is_deleting(claim) {
            return Ok(ReconcileResult::done());
        }

        let Some(lease) = state.lease.clone() else {
            return self.create_lease(state).await;
        };
        let Some(phase) = lease.status.as_ref().and_then(|s| s.phase) else {
            debug!("Lease {} is not reconciled yet", ObjectKey::of(&lease));
            return Ok(ReconcileResult::requeue_after(LEASE_REQUEUE));
        };
        if is_bound_to(&lease, claim) {
            claim.status.get_or_insert_with(Default::default).lease = lease.metadata.name.clone().unwrap_or_default();
            return Ok(ReconcileResult::done());
        }
        if phase == LeasePhase::Bound {
            warn!("Lease {} is bound to another claim", ObjectKey::of(&lease));
            return Ok(ReconcileResult::done());
        }
        let claim = claim.clone();
        if let Some(bound) = self.bind_lease(&claim, &lease).await? {
            state.lease = Some(bound);
        }
        Ok(ReconcileResult::requeue_after(LEASE_REQUEUE))
    }

    async fn update_status(&self, state: &mut Self::State) -> Result<ReconcileResult, ControllerError> {
        if state.deleted {
            return Ok(ReconcileResult::done());
        }
        let lease = state.lease.clone();
        let allocation_error = state.allocation_error.clone();
        let Some(claim) = state.resource.changed_mut() else {
            return Ok(ReconcileResult::done());
        };
        if meta::is_deleting(claim) {
            return Ok(ReconcileResult::done());
        }

        let lease_name = lease.as_ref().and_then(|l| l.metadata.name.clone()).unwrap_or_default();
        let lease_phase = lease.as_ref().and_then(|l| l.status.as_ref()).and_then(|s| s.phase);
        let bound_here = lease.as_ref().is_some_and(|l| is_bound_to(l, claim));
        let vm_name = bound_vm(claim).unwrap_or_default().to_string();
        let address = claim.status.as_ref().map(|s| s.address.clone()).unwrap_or_default();

        let (phase, condition, reason, message) = match (&lease, lease_phase) {
            (None, _) if !address.is_empty() => (
                ClaimPhase::Lost,
                ConditionStatus::False,
                ClaimReason::LeaseLost,
                format!("VirtualMachineIPAddressLease {} doesn't exist", lease_name_from_ip(&address)),
            ),
            (None, _) => match allocation_error {
                Some(message) => (ClaimPhase::Pending, ConditionStatus::False, ClaimReason::AddressNotAvailable, message),
                None => (
                    ClaimPhase::Pending,
                    ConditionStatus::False,
                    ClaimReason::LeaseNotFound,
                    "VirtualMachineIPAddressLease is not found".to_string(),
                ),
            },
            (Some(_), Some(LeasePhase::Bound)) if bound_here => {
                (ClaimPhase::Bound, ConditionStatus::True, ClaimReason::Bound, String::new())
            }
            (Some(_), Some(LeasePhase::Bound)) => (
                ClaimPhase::Conflict,
                ConditionStatus::False,
                ClaimReason::LeaseAlreadyExists,
                format!("VirtualMachineIPAddressLease {lease_name} is bound to another VirtualMachineIPAddressClaim"),
            ),
            (Some(_), _) => (
                ClaimPhase::Pending,
                ConditionStatus::False,
                ClaimReason::LeaseNotReady,
                format!("VirtualMachineIPAddressLease {lease_name} is not ready"),
            ),
        };

        let status = claim.status.get_or_insert_with(Default::default);
        status.phase = phase;
        status.virtual_machine_name = vm_name;
        status.conflict_message = if phase == ClaimPhase::Conflict {
            CONFLICT_MESSAGE.to_string()
        } else {
            String::new()
        };
        if phase == ClaimPhase::Bound {
            status.address = ip_from_lease_name(&lease_name).unwrap_or_default();
            status.lease = lease_name;
        }
        bound_condition(claim, condition, reason, &message);
        Ok(ReconcileResult::done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::reconcile;
    use crate::test_utils::{create_test_lease, create_test_vm, test_context};
    use crds::{ClaimRef, VirtualMachineIPAddressLeaseStatus};

    fn key(name: &str) -> ObjectKey {
        ObjectKey::namespaced("default", name)
    }

    async fn stored_claim(ctx: &Arc<Context>, name: &str) -> Option<Claim> {
        ctx.store.get(Some("default"), name).await.unwrap()
    }

    fn with_lease_phase(mut lease: Lease, phase: LeasePhase, claim: Option<ClaimRef>) -> Lease {
        lease.spec.claim_ref = claim;
        lease.status = Some(VirtualMachineIPAddressLeaseStatus {
            phase: Some(phase),
            ..Default::default()
        });
        lease
    }

    #[tokio::test]
    async fn test_claim_of_vm_gets_lease() {
        let (ctx, backend, recorder) = test_context();
        let vm = create_test_vm("web", "default");
        backend.seed(&vm);
        ctx.ipam().create_ip_address_claim(&vm).await.unwrap();
        let reconciler = ClaimReconciler::new(Arc::clone(&ctx));

        let result = reconcile(&reconciler, &key("web")).await.unwrap();

        assert_eq!(result, ReconcileResult::requeue_after(LEASE_REQUEUE));
        let lease: Lease = ctx.store.get(None, "ip-10-66-10-1").await.unwrap().unwrap();
        assert_eq!(lease.spec.claim_ref.unwrap().name, "web");
        let claim = stored_claim(&ctx, "web").await.unwrap();
        assert!(meta::has_finalizer(&claim, FINALIZER_VMIP_CLEANUP));
        let status = claim.status.unwrap();
        assert_eq!(status.phase, ClaimPhase::Pending);
        assert_eq!(status.lease, "ip-10-66-10-1");
        assert_eq!(recorder.events()[0].0, reasons::BOUND);
    }

    #[tokio::test]
    async fn test_bound_lease_binds_claim() {
        let (ctx, backend, _) = test_context();
        let vm = create_test_vm("web", "default");
        backend.seed(&vm);
        let claim = ctx.ipam().create_ip_address_claim(&vm).await.unwrap();
        backend.seed(&with_lease_phase(
            create_test_lease("10.66.10.5"),
            LeasePhase::Bound,
            Some(claim_ref(&claim)),
        ));
        let mut claim = claim;
        claim.spec.virtual_machine_ip_address_lease_name = "ip-10-66-10-5".to_string();
        ctx.store.update(&claim).await.unwrap();

        reconcile(&ClaimReconciler::new(Arc::clone(&ctx)), &key("web")).await.unwrap();

        let status = stored_claim(&ctx, "web").await.unwrap().status.unwrap();
        assert_eq!(status.phase, ClaimPhase::Bound);
        assert_eq!(status.address, "10.66.10.5");
        assert_eq!(status.virtual_machine_name, "web");
    }

    #[tokio::test]
    async fn test_lease_of_another_claim_conflicts() {
        let (ctx, backend, _) = test_context();
        let vm = create_test_vm("web", "default");
        backend.seed(&vm);
        let mut claim = ctx.ipam().create_ip_address_claim(&vm).await.unwrap();
        backend.seed(&with_lease_phase(
            create_test_lease("10.66.10.5"),
            LeasePhase::Bound,
            Some(ClaimRef {
                namespace: "default".to_string(),
                name: "other".to_string(),
            }),
        ));
        claim.spec.address = "10.66.10.5".to_string();
        ctx.store.update(&claim).await.unwrap();

        reconcile(&ClaimReconciler::new(Arc::clone(&ctx)), &key("web")).await.unwrap();

        let status = stored_claim(&ctx, "web").await.unwrap().status.unwrap();
        assert_eq!(status.phase, ClaimPhase::Conflict);
        assert_eq!(status.conflict_message, CONFLICT_MESSAGE);
    }

    #[tokio::test]
    async fn test_unused_implicit_claim_is_deleted() {
        let (ctx, _, _) = test_context();
        ctx.ipam().create_ip_address_claim(&create_test_vm("gone", "default")).await.unwrap();

        reconcile(&ClaimReconciler::new(Arc::clone(&ctx)), &key("gone")).await.unwrap();

        assert!(stored_claim(&ctx, "gone").await.is_none());
    }

    #[tokio::test]
    async fn test_out_of_range_address_is_reported() {
        let (ctx, backend, recorder) = test_context();
        let mut vm = create_test_vm("web", "default");
        vm.spec.virtual_machine_ip_address = "static".to_string();
        backend.seed(&vm);
        let mut claim = Claim::new("static", Default::default());
        claim.metadata.namespace = Some("default".to_string());
        claim.spec.address = "192.168.1.10".to_string();
        backend.seed(&claim);

        reconcile(&ClaimReconciler::new(Arc::clone(&ctx)), &key("static")).await.unwrap();

        let claim = stored_claim(&ctx, "static").await.unwrap();
        assert_eq!(bound_vm(&claim), Some("web"));
        let status = claim.status.unwrap();
        assert_eq!(status.phase, ClaimPhase::Pending);
        assert_eq!(status.conditions[0].reason, "VirtualMachineIPAddressIsOutOfTheValidRange");
        assert_eq!(recorder.events()[0].0, reasons::IP_ADDRESS_NOT_AVAILABLE);
    }
}
