//! Cleanup finalizer.
//!
//! A live object always carries the cleanup finalizer. Once it is deleted,
//! every source removes its supplements and the finalizer is dropped only
//! when nothing is left.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::ControllerError;
use crate::meta;
use crate::provisionable::Provisionable;
use crate::reconciler::ReconcileResult;
use crate::reconciler::chain::{Handler, HandlerOutcome};
use crate::source::Sources;

/// Adds the cleanup finalizer and releases it after clean-up.
#[derive(Debug)]
pub struct DeletionHandler<K> {
    sources: Arc<Sources<K>>,
}

impl<K> DeletionHandler<K> {
    /// Creates the handler.
    pub fn new(sources: Arc<Sources<K>>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl<K: Provisionable> Handler<K> for DeletionHandler<K> {
    fn name(&self) -> &'static str {
        "deletion"
    }

    async fn handle(&self, obj: &mut K) -> Result<HandlerOutcome, ControllerError> {
        if !meta::is_deleting(obj) {
            meta::add_finalizer(obj, K::CLEANUP_FINALIZER);
            return Ok(HandlerOutcome::proceed());
        }

        if self.sources.clean_up(obj).await? {
            debug!("Supplements of {} are still being removed", crate::store::ObjectKey::of(obj));
            return Ok(HandlerOutcome::Continue(ReconcileResult::requeue()));
        }

        if meta::remove_finalizer(obj, K::CLEANUP_FINALIZER) {
            info!("Released {} {}", K::kind(&()), crate::store::ObjectKey::of(obj));
        }
        Ok(HandlerOutcome::proceed())
    }
}
