//! Phase state machine of provisionable objects.
//!
//! Delegates to the source of the data source type once the data source is
//! ready. A spec change while the object is not Ready restarts provisioning
//! from scratch.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crds::conditions::image::{ConditionType, ReadyReason};
use crds::conditions::{ConditionStatus, find_condition};

use crate::error::ControllerError;
use crate::meta;
use crate::provisionable::{Phase, Provisionable};
use crate::reconciler::ReconcileResult;
use crate::reconciler::chain::{Handler, HandlerOutcome};
use crate::source::{Sources, is_ready, set_ready};
use crate::store::ObjectKey;

/// Drives provisioning through the source of the object's data source.
#[derive(Debug)]
pub struct LifeCycleHandler<K> {
    sources: Arc<Sources<K>>,
}

impl<K> LifeCycleHandler<K> {
    /// Creates the handler.
    pub fn new(sources: Arc<Sources<K>>) -> Self {
        Self { sources }
    }
}

/// Returns true when the spec changed after the last provisioning attempt.
fn is_outdated<K: Provisionable>(obj: &K) -> bool {
    find_condition(obj.conditions(), ConditionType::Ready.as_str())
        .is_some_and(|c| !c.is_true() && c.observed_generation != meta::generation(obj))
}

#[async_trait]
impl<K: Provisionable> Handler<K> for LifeCycleHandler<K> {
    fn name(&self) -> &'static str {
        "life-cycle"
    }

    async fn handle(&self, obj: &mut K) -> Result<HandlerOutcome, ControllerError> {
        if meta::is_deleting(obj) {
            obj.set_phase(Phase::Terminating);
            return Ok(HandlerOutcome::proceed());
        }

        if obj.phase() == Phase::Lost {
            return Ok(HandlerOutcome::proceed());
        }

        let datasource_ready = find_condition(obj.conditions(), ConditionType::DatasourceReady.as_str())
            .is_some_and(|c| c.is_true());
        if !datasource_ready {
            if !is_ready(obj) {
                obj.set_phase(Phase::Pending);
                set_ready(
                    obj,
                    ConditionStatus::False,
                    ReadyReason::ProvisioningNotStarted,
                    "Waiting for the data source to be ready",
                );
            }
            return Ok(HandlerOutcome::proceed());
        }

        // A new object is reported Pending once before its source starts.
        if find_condition(obj.conditions(), ConditionType::Ready.as_str()).is_none() {
            obj.set_phase(Phase::Pending);
            set_ready(
                obj,
                ConditionStatus::False,
                ReadyReason::ProvisioningNotStarted,
                "Provisioning is about to start",
            );
            return Ok(HandlerOutcome::Continue(ReconcileResult::requeue()));
        }

        if is_outdated(obj) {
            info!("Spec of {} {} changed, restarting provisioning", K::kind(&()), ObjectKey::of(obj));
            obj.reset_status();
            if self.sources.clean_up(obj).await? {
                return Ok(HandlerOutcome::Stop(ReconcileResult::requeue()));
            }
            set_ready(
                obj,
                ConditionStatus::False,
                ReadyReason::ProvisioningNotStarted,
                "Provisioning restarts after the spec change",
            );
            return Ok(HandlerOutcome::Stop(ReconcileResult::requeue()));
        }

        let Some(source) = self.sources.get(obj.data_source().type_) else {
            return Ok(HandlerOutcome::proceed());
        };
        let result = source.sync(obj).await?;
        obj.set_observed_generation(meta::generation(obj));

        Ok(HandlerOutcome::Continue(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{DatasourceReadyHandler, DeletionHandler};
    use crate::reconciler::chain::Chain;
    use crate::source::all_sources;
    use crate::test_utils::{create_test_cvi, mark_deleting, test_context};
    use crds::ClusterVirtualImage;
    use crds::annotations::FINALIZER_CVI_CLEANUP;

    fn chain(ctx: &Arc<crate::context::Context>) -> Chain<ClusterVirtualImage> {
        let sources = Arc::new(all_sources(ctx));
        Chain::new()
            .with(DeletionHandler::new(Arc::clone(&sources)))
            .with(DatasourceReadyHandler::new(Arc::clone(&sources)))
            .with(LifeCycleHandler::new(sources))
    }

    #[tokio::test]
    async fn test_fresh_object_gets_finalizer_and_pending() {
        let (ctx, backend, _) = test_context();
        let mut cvi = create_test_cvi("ubuntu");

        let result = chain(&ctx).run(&mut cvi).await.unwrap();

        assert_eq!(result, ReconcileResult::requeue());
        assert!(meta::has_finalizer(&cvi, FINALIZER_CVI_CLEANUP));
        assert_eq!(cvi.phase(), Phase::Pending);
        assert!(find_condition(cvi.conditions(), "DatasourceReady").unwrap().is_true());
        assert_eq!(find_condition(cvi.conditions(), "Ready").unwrap().reason, "ProvisioningNotStarted");
        assert_eq!(backend.count("Pod"), 0);
    }

    #[tokio::test]
    async fn test_second_pass_starts_source() {
        let (ctx, backend, _) = test_context();
        let mut cvi = create_test_cvi("ubuntu");
        let chain = chain(&ctx);
        chain.run(&mut cvi).await.unwrap();

        chain.run(&mut cvi).await.unwrap();

        assert_eq!(cvi.phase(), Phase::Provisioning);
        assert_eq!(backend.count("Pod"), 1);
    }

    #[tokio::test]
    async fn test_invalid_source_keeps_object_pending() {
        let (ctx, _, _) = test_context();
        let mut cvi = create_test_cvi("ubuntu");
        cvi.spec.data_source.http = None;

        chain(&ctx).run(&mut cvi).await.unwrap();

        assert_eq!(cvi.phase(), Phase::Pending);
        let ready = find_condition(cvi.conditions(), "Ready").unwrap();
        assert_eq!(ready.reason, "ProvisioningNotStarted");
    }

    #[tokio::test]
    async fn test_spec_change_restarts_failed_provisioning() {
        let (ctx, _, _) = test_context();
        let handler = LifeCycleHandler::new(Arc::new(all_sources(&ctx)));
        let mut cvi = create_test_cvi("ubuntu");
        DatasourceReadyHandler::new(Arc::new(all_sources(&ctx)))
            .handle(&mut cvi)
            .await
            .unwrap();
        cvi.set_phase(Phase::Failed);
        set_ready(&mut cvi, ConditionStatus::False, ReadyReason::ProvisioningFailed, "bad checksum");
        cvi.metadata.generation = Some(2);

        let outcome = handler.handle(&mut cvi).await.unwrap();

        assert_eq!(outcome, HandlerOutcome::Stop(ReconcileResult::requeue()));
        assert_eq!(cvi.phase(), Phase::Pending);
        let ready = find_condition(cvi.conditions(), "Ready").unwrap();
        assert_eq!(ready.observed_generation, 2);
        assert!(!is_outdated(&cvi));
    }

    #[tokio::test]
    async fn test_deleting_object_is_terminating() {
        let (ctx, _, _) = test_context();
        let handler = LifeCycleHandler::new(Arc::new(all_sources(&ctx)));
        let mut cvi = create_test_cvi("ubuntu");
        mark_deleting(&mut cvi);

        handler.handle(&mut cvi).await.unwrap();

        assert_eq!(cvi.phase(), Phase::Terminating);
    }
}
