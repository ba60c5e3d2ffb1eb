//! Detects Ready images that disappeared from DVCR.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use tracing::warn;

use crds::conditions::ConditionStatus;
use crds::conditions::image::ReadyReason;

use crate::context::Context;
use crate::error::ControllerError;
use crate::provisionable::{Phase, Provisionable};
use crate::reconciler::ReconcileResult;
use crate::reconciler::chain::{Handler, HandlerOutcome};
use crate::service::recorder::{object_ref, reasons};
use crate::source::set_ready;

/// Delay between two presence checks of a Ready image.
pub const PRESENCE_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Moves a Ready image to Lost once its DVCR image is gone. There is no way
/// back from Lost. Present images are checked again every
/// [`PRESENCE_CHECK_INTERVAL`].
#[derive(Debug)]
pub struct ImagePresenceHandler<K> {
    ctx: Arc<Context>,
    kind: PhantomData<fn() -> K>,
}

impl<K> ImagePresenceHandler<K> {
    /// Creates the handler.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx, kind: PhantomData }
    }
}

#[async_trait]
impl<K: Provisionable> Handler<K> for ImagePresenceHandler<K> {
    fn name(&self) -> &'static str {
        "image-presence"
    }

    async fn handle(&self, obj: &mut K) -> Result<HandlerOutcome, ControllerError> {
        let url = obj.target_registry_url();
        if obj.phase() != Phase::Ready || url.is_empty() || obj.is_stored_on_pvc() {
            return Ok(HandlerOutcome::proceed());
        }

        if self.ctx.checker.check_image_exists(url).await? {
            return Ok(HandlerOutcome::Continue(ReconcileResult::requeue_after(
                PRESENCE_CHECK_INTERVAL,
            )));
        }

        let message = format!("The image {url} is missing from DVCR.");
        warn!("{}", message);
        obj.set_phase(Phase::Lost);
        set_ready(obj, ConditionStatus::False, ReadyReason::ImageLost, &message);
        self.ctx
            .recorder
            .publish(&object_ref(&*obj), EventType::Warning, reasons::IMAGE_LOST, message)
            .await;

        Ok(HandlerOutcome::proceed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_cvi, create_test_vi, test_context_with};
    use crds::ClusterVirtualImage;
    use crds::conditions::find_condition;
    use dvcr_client::MockImageChecker;

    const IMAGE: &str = "dvcr.d8-virtualization.svc/cvi/ubuntu:latest";

    fn ready_cvi() -> ClusterVirtualImage {
        let mut cvi = create_test_cvi("ubuntu");
        cvi.set_phase(Phase::Ready);
        set_ready(&mut cvi, ConditionStatus::True, ReadyReason::Ready, "");
        cvi.set_target_registry_url(IMAGE.to_string());
        cvi
    }

    #[tokio::test]
    async fn test_present_image_stays_ready() {
        let checker = MockImageChecker::new();
        checker.set_image(IMAGE, true);
        let (ctx, _, recorder) = test_context_with(checker.clone());
        let mut cvi = ready_cvi();

        let outcome = ImagePresenceHandler::new(ctx).handle(&mut cvi).await.unwrap();

        assert_eq!(
            outcome,
            HandlerOutcome::Continue(ReconcileResult::requeue_after(PRESENCE_CHECK_INTERVAL))
        );
        assert_eq!(cvi.phase(), Phase::Ready);
        assert_eq!(checker.calls(), 1);
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_missing_image_is_lost() {
        let (ctx, _, recorder) = test_context_with(MockImageChecker::new());
        let mut cvi = ready_cvi();

        let outcome = ImagePresenceHandler::new(ctx).handle(&mut cvi).await.unwrap();

        assert_eq!(outcome, HandlerOutcome::proceed());
        assert_eq!(cvi.phase(), Phase::Lost);
        let ready = find_condition(cvi.conditions(), "Ready").unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, "ImageLost");
        assert_eq!(recorder.events()[0].0, reasons::IMAGE_LOST);
    }

    #[tokio::test]
    async fn test_registry_error_keeps_phase() {
        let checker = MockImageChecker::new();
        checker.fail_with("connection refused");
        let (ctx, _, _) = test_context_with(checker);
        let mut cvi = ready_cvi();

        let result = ImagePresenceHandler::new(ctx).handle(&mut cvi).await;

        assert!(matches!(result, Err(ControllerError::Dvcr(_))));
        assert_eq!(cvi.phase(), Phase::Ready);
    }

    #[tokio::test]
    async fn test_checker_not_called_before_ready() {
        let checker = MockImageChecker::new();
        let (ctx, _, _) = test_context_with(checker.clone());
        let handler = ImagePresenceHandler::new(ctx);

        let mut provisioning = ready_cvi();
        provisioning.set_phase(Phase::Provisioning);
        handler.handle(&mut provisioning).await.unwrap();

        let mut without_url = create_test_cvi("empty");
        without_url.set_phase(Phase::Ready);
        handler.handle(&mut without_url).await.unwrap();

        assert_eq!(checker.calls(), 0);
        assert_eq!(provisioning.phase(), Phase::Provisioning);
    }

    #[tokio::test]
    async fn test_image_on_pvc_is_not_checked() {
        let checker = MockImageChecker::new();
        let (ctx, _, _) = test_context_with(checker.clone());
        let mut vi = create_test_vi("ubuntu", "default");
        vi.spec.storage = crds::ImageStorage::PersistentVolumeClaim;
        vi.set_phase(Phase::Ready);
        vi.set_target_registry_url(IMAGE.to_string());

        ImagePresenceHandler::new(ctx).handle(&mut vi).await.unwrap();

        assert_eq!(checker.calls(), 0);
        assert_eq!(vi.phase(), Phase::Ready);
    }
}
