//! Postpones provisioning of new objects while DVCR is in maintenance.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crds::conditions::image::{ConditionType, ReadyReason};
use crds::conditions::{ConditionStatus, find_condition, remove_condition};

use crate::context::Context;
use crate::error::ControllerError;
use crate::meta;
use crate::provisionable::{Phase, Provisionable};
use crate::reconciler::ReconcileResult;
use crate::reconciler::chain::{Handler, HandlerOutcome};
use crate::source::set_ready;
use crate::store::ObjectKey;

const POSTPONE_REQUEUE: Duration = Duration::from_secs(15);

/// Stops the chain for objects not started yet while the registry is
/// being garbage collected.
#[derive(Debug)]
pub struct PostponeHandler<K> {
    ctx: Arc<Context>,
    kind: PhantomData<fn() -> K>,
}

impl<K> PostponeHandler<K> {
    /// Creates the handler.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx, kind: PhantomData }
    }
}

#[async_trait]
impl<K: Provisionable> Handler<K> for PostponeHandler<K> {
    fn name(&self) -> &'static str {
        "postpone"
    }

    async fn handle(&self, obj: &mut K) -> Result<HandlerOutcome, ControllerError> {
        if meta::is_deleting(obj) {
            return Ok(HandlerOutcome::proceed());
        }

        let ready = find_condition(obj.conditions(), ConditionType::Ready.as_str());
        let postponed = ready.is_some_and(|c| c.reason == ReadyReason::ProvisioningPostponed.as_str());
        if ready.is_some() && !postponed {
            return Ok(HandlerOutcome::proceed());
        }

        if self.ctx.maintenance().is_maintenance_active().await? {
            if !postponed {
                info!("DVCR is in maintenance, postponing {} {}", K::kind(&()), ObjectKey::of(obj));
            }
            obj.set_phase(Phase::Pending);
            set_ready(
                obj,
                ConditionStatus::False,
                ReadyReason::ProvisioningPostponed,
                "DVCR is in maintenance mode: provisioning will start once the garbage collection is finished",
            );
            return Ok(HandlerOutcome::Stop(ReconcileResult::requeue_after(POSTPONE_REQUEUE)));
        }

        if postponed {
            remove_condition(obj.conditions_mut(), ConditionType::Ready.as_str());
        }
        Ok(HandlerOutcome::proceed())
    }
}
