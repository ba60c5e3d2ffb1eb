//! Handler chain
//!
//! Ordered handlers run against the changed copy of an object. A handler
//! either lets the chain continue, stops it, or fails it with an error; the
//! results of the handlers that ran are merged.

use tracing::{debug, error};

use super::ReconcileResult;
use crate::error::ControllerError;

/// Outcome of a handler that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Run the next handler
    Continue(ReconcileResult),
    /// Skip the remaining handlers
    Stop(ReconcileResult),
}

impl HandlerOutcome {
    /// Continue without requeue.
    pub fn proceed() -> Self {
        Self::Continue(ReconcileResult::done())
    }
}

/// One idempotent step of a reconcile.
#[async_trait::async_trait]
pub trait Handler<T: Send + Sync>: Send + Sync {
    /// Handler name for logs.
    fn name(&self) -> &'static str;

    /// Handles the object, mutating its changed copy.
    async fn handle(&self, obj: &mut T) -> Result<HandlerOutcome, ControllerError>;
}

/// Ordered list of handlers.
pub struct Chain<T> {
    handlers: Vec<Box<dyn Handler<T>>>,
}

impl<T: Send + Sync> std::fmt::Debug for Chain<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|h| h.name()))
            .finish()
    }
}

impl<T: Send + Sync> Default for Chain<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync> Chain<T> {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    /// Appends a handler.
    #[must_use]
    pub fn with(mut self, handler: impl Handler<T> + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Runs the handlers in order.
    pub async fn run(&self, obj: &mut T) -> Result<ReconcileResult, ControllerError> {
        let mut result = ReconcileResult::done();

        for handler in &self.handlers {
            debug!("Run handler {}", handler.name());
            match handler.handle(obj).await {
                Ok(HandlerOutcome::Continue(r)) => result = result.merge(r),
                Ok(HandlerOutcome::Stop(r)) => {
                    debug!("Handler {} stopped the chain", handler.name());
                    return Ok(result.merge(r));
                }
                Err(e) => {
                    error!("Handler {} failed: {}", handler.name(), e);
                    return Err(e);
                }
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Push(&'static str, HandlerOutcome);

    #[async_trait::async_trait]
    impl Handler<Vec<&'static str>> for Push {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn handle(&self, obj: &mut Vec<&'static str>) -> Result<HandlerOutcome, ControllerError> {
            obj.push(self.0);
            Ok(self.1)
        }
    }

    struct Fail;

    #[async_trait::async_trait]
    impl Handler<Vec<&'static str>> for Fail {
        fn name(&self) -> &'static str {
            "fail"
        }

        async fn handle(&self, _obj: &mut Vec<&'static str>) -> Result<HandlerOutcome, ControllerError> {
            Err(ControllerError::Watch("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn test_stop_skips_remaining_handlers() {
        let chain = Chain::new()
            .with(Push("a", HandlerOutcome::Continue(ReconcileResult::requeue_after(Duration::from_secs(2)))))
            .with(Push("b", HandlerOutcome::Stop(ReconcileResult::requeue_after(Duration::from_secs(15)))))
            .with(Push("c", HandlerOutcome::proceed()));
        let mut seen = Vec::new();

        let result = chain.run(&mut seen).await.unwrap();

        assert_eq!(seen, vec!["a", "b"]);
        assert_eq!(result, ReconcileResult::requeue_after(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_error_short_circuits() {
        let chain = Chain::new()
            .with(Push("a", HandlerOutcome::proceed()))
            .with(Fail)
            .with(Push("c", HandlerOutcome::proceed()));
        let mut seen = Vec::new();

        assert!(chain.run(&mut seen).await.is_err());
        assert_eq!(seen, vec!["a"]);
    }
}
