//! VirtualMachineIPAddressLease reconciler.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crds::conditions::vmip::{LeaseConditionType, LeaseReason};
use crds::conditions::{ConditionBuilder, ConditionStatus, set_condition};
use crds::{LeasePhase, ReclaimPolicy, VirtualMachineIPAddressClaim, VirtualMachineIPAddressLease};

use crate::context::Context;
use crate::error::ControllerError;
use crate::meta;
use crate::reconciler::resource::Resource;
use crate::reconciler::{ReconcileResult, ReconcilerState, TwoPhaseReconciler};
use crate::store::ObjectKey;

type Lease = VirtualMachineIPAddressLease;

/// State of one lease reconcile.
#[derive(Debug)]
pub struct LeaseState {
    ctx: Arc<Context>,
    resource: Resource<Lease>,
    claim: Option<VirtualMachineIPAddressClaim>,
    deleted: bool,
}

#[async_trait]
impl ReconcilerState for LeaseState {
    async fn reload(&mut self) -> Result<(), ControllerError> {
        self.resource.fetch().await?;
        let claim_ref = self.resource.current().and_then(|l| l.spec.claim_ref.clone());
        self.claim = match claim_ref {
            Some(r) => self.ctx.store.get(Some(&r.namespace), &r.name).await?,
            None => None,
        };
        Ok(())
    }

    fn should_reconcile(&self) -> bool {
        !self.resource.is_empty()
    }

    async fn apply_sync(&mut self) -> Result<(), ControllerError> {
        if !self.deleted {
            self.resource.update_meta().await?;
        }
        Ok(())
    }

    async fn apply_update_status(&mut self) -> Result<(), ControllerError> {
        if !self.deleted {
            self.resource.update_status().await?;
        }
        Ok(())
    }
}

/// Reconciles VirtualMachineIPAddressLeases.
#[derive(Debug)]
pub struct LeaseReconciler {
    ctx: Arc<Context>,
}

impl LeaseReconciler {
    /// Creates the reconciler.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl TwoPhaseReconciler for LeaseReconciler {
    type State = LeaseState;

    fn new_state(&self, key: &ObjectKey) -> Self::State {
        LeaseState {
            ctx: Arc::clone(&self.ctx),
            resource: Resource::new(key.clone(), self.ctx.store.clone()),
            claim: None,
            deleted: false,
        }
    }

    async fn sync(&self, state: &mut Self::State) -> Result<ReconcileResult, ControllerError> {
        let Some(lease) = state.resource.changed() else {
            return Ok(ReconcileResult::done());
        };
        if state.claim.is_some() || lease.spec.reclaim_policy != ReclaimPolicy::Delete || meta::is_deleting(lease) {
            return Ok(ReconcileResult::done());
        }
        info!("Deleting released lease {}", ObjectKey::of(lease));
        self.ctx.store.delete_object(lease).await?;
        state.deleted = true;
        Ok(ReconcileResult::done())
    }

    async fn update_status(&self, state: &mut Self::State) -> Result<ReconcileResult, ControllerError> {
        if state.deleted {
            return Ok(ReconcileResult::done());
        }
        let bound = state.claim.is_some();
        let Some(lease) = state.resource.changed_mut() else {
            return Ok(ReconcileResult::done());
        };
        let cb = ConditionBuilder::new(LeaseConditionType::Bound).generation(meta::generation(lease));
        let (phase, condition) = if bound {
            (
                LeasePhase::Bound,
                cb.status(ConditionStatus::True).reason(LeaseReason::Bound).build(),
            )
        } else {
            (
                LeasePhase::Released,
                cb.status(ConditionStatus::False)
                    .reason(LeaseReason::Released)
                    .message("VirtualMachineIPAddressClaim not found")
                    .build(),
            )
        };
        let status = lease.status.get_or_insert_with(Default::default);
        status.phase = Some(phase);
        set_condition(&mut status.conditions, condition);
        Ok(ReconcileResult::done())
    }
}
