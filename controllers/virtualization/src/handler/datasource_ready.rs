//! `DatasourceReady` condition.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crds::conditions::image::{ConditionType, DatasourceReadyReason};
use crds::conditions::{ConditionBuilder, ConditionStatus, set_condition};

use crate::error::ControllerError;
use crate::meta;
use crate::provisionable::Provisionable;
use crate::reconciler::chain::{Handler, HandlerOutcome};
use crate::source::Sources;
use crate::store::ObjectKey;

/// Validates the data source without side effects.
#[derive(Debug)]
pub struct DatasourceReadyHandler<K> {
    sources: Arc<Sources<K>>,
}

impl<K> DatasourceReadyHandler<K> {
    /// Creates the handler.
    pub fn new(sources: Arc<Sources<K>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl<K: Provisionable> Handler<K> for DatasourceReadyHandler<K> {
    fn name(&self) -> &'static str {
        "datasource-ready"
    }

    async fn handle(&self, obj: &mut K) -> Result<HandlerOutcome, ControllerError> {
        if meta::is_deleting(obj) {
            return Ok(HandlerOutcome::proceed());
        }

        let cb = ConditionBuilder::new(ConditionType::DatasourceReady).generation(meta::generation(obj));
        let type_ = obj.data_source().type_;
        let condition = match self.sources.get(type_) {
            None => cb
                .status(ConditionStatus::False)
                .reason(DatasourceReadyReason::DatasourceInvalid)
                .message(format!("data source type {type_:?} is not supported")),
            Some(source) => match source.validate(obj).await {
                Ok(()) => cb
                    .status(ConditionStatus::True)
                    .reason(DatasourceReadyReason::DatasourceReady)
                    .clear_message(),
                Err(ControllerError::Source(e)) => {
                    debug!("Data source of {} is not ready: {}", ObjectKey::of(obj), e);
                    cb.status(ConditionStatus::False).reason(e.reason()).message(e.to_string())
                }
                Err(e) => return Err(e),
            },
        };

        set_condition(obj.conditions_mut(), condition.build());
        Ok(HandlerOutcome::proceed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::all_sources;
    use crate::test_utils::{create_test_cvi, create_test_vi, test_context};
    use crds::conditions::find_condition;
    use crds::{DataSourceObjectRef, DataSourceType, ObjectRefKind};

    #[tokio::test]
    async fn test_valid_source_is_ready_and_idempotent() {
        let (ctx, _, _) = test_context();
        let handler = DatasourceReadyHandler::new(Arc::new(all_sources(&ctx)));
        let mut cvi = create_test_cvi("ubuntu");

        handler.handle(&mut cvi).await.unwrap();
        let first = cvi.clone();
        handler.handle(&mut cvi).await.unwrap();

        assert_eq!(cvi, first);
        let condition = find_condition(cvi.conditions(), "DatasourceReady").unwrap();
        assert!(condition.is_true());
        assert_eq!(condition.reason, "DatasourceReady");
    }

    #[tokio::test]
    async fn test_missing_image_reports_typed_reason() {
        let (ctx, _, _) = test_context();
        let handler = DatasourceReadyHandler::new(Arc::new(all_sources(&ctx)));
        let mut vi = create_test_vi("copy", "default");
        vi.spec.data_source.type_ = DataSourceType::ObjectRef;
        vi.spec.data_source.object_ref = Some(DataSourceObjectRef {
            kind: ObjectRefKind::ClusterVirtualImage,
            name: "ubuntu".to_string(),
            namespace: None,
        });

        handler.handle(&mut vi).await.unwrap();

        let condition = find_condition(vi.conditions(), "DatasourceReady").unwrap();
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(condition.reason, "ClusterImageNotReady");
        assert!(condition.message.contains("ubuntu"));
    }
}
