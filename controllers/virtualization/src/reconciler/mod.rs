//! Two-phase reconciler core
//!
//! Every kind is reconciled the same way: reload the object and its children,
//! decide whether there is anything to do, run `sync` and persist metadata,
//! then run `update_status` and persist the status subresource.
//!
//! `update_status` still runs after a `sync` error so the status reflects what
//! went wrong; the `sync` error is the one returned. A failed write is returned
//! at once: conflicts are resolved by the next reconcile starting from scratch.

pub mod chain;
pub mod resource;

use std::time::Duration;

use kube_runtime::controller::Action;
use tracing::{debug, error};

use crate::error::ControllerError;
use crate::store::ObjectKey;

/// What the scheduler should do with the key next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    /// Requeue with the scheduler's default delay
    pub requeue: bool,
    /// Requeue after a fixed delay
    pub requeue_after: Option<Duration>,
}

impl ReconcileResult {
    /// Nothing to do until the next change.
    pub fn done() -> Self {
        Self::default()
    }

    /// Requeue soon.
    pub fn requeue() -> Self {
        Self {
            requeue: true,
            requeue_after: None,
        }
    }

    /// Requeue after `delay`.
    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue: false,
            requeue_after: Some(delay),
        }
    }

    /// Returns true when no requeue was requested.
    pub fn is_empty(&self) -> bool {
        !self.requeue && self.requeue_after.is_none_or(|d| d.is_zero())
    }

    /// Merges two handler results: a plain requeue wins, otherwise the
    /// smallest non-zero delay.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        if self.requeue || other.requeue {
            return Self::requeue();
        }
        let delay = [self.requeue_after, other.requeue_after]
            .into_iter()
            .flatten()
            .filter(|d| !d.is_zero())
            .min();
        Self {
            requeue: false,
            requeue_after: delay,
        }
    }

    /// Converts into a controller action.
    pub fn into_action(self) -> Action {
        match (self.requeue, self.requeue_after) {
            (true, _) => Action::requeue(Duration::from_secs(1)),
            (false, Some(delay)) if !delay.is_zero() => Action::requeue(delay),
            _ => Action::await_change(),
        }
    }
}

/// Per-reconcile state: the object, its children and how to persist them.
#[async_trait::async_trait]
pub trait ReconcilerState: Send {
    /// Fetches the primary object and the children it refers to.
    async fn reload(&mut self) -> Result<(), ControllerError>;

    /// Returns false when there is nothing to reconcile.
    fn should_reconcile(&self) -> bool;

    /// Persists metadata and spec changes made by `sync`.
    async fn apply_sync(&mut self) -> Result<(), ControllerError>;

    /// Persists status changes made by `update_status`.
    async fn apply_update_status(&mut self) -> Result<(), ControllerError>;
}

/// A reconciler split into a `sync` and an `update_status` phase.
#[async_trait::async_trait]
pub trait TwoPhaseReconciler: Send + Sync {
    /// State built for each reconcile.
    type State: ReconcilerState;

    /// Creates an empty state for the key.
    fn new_state(&self, key: &ObjectKey) -> Self::State;

    /// Brings the world in line with the object.
    async fn sync(&self, state: &mut Self::State) -> Result<ReconcileResult, ControllerError>;

    /// Reports the observed world in the object's status.
    async fn update_status(&self, state: &mut Self::State) -> Result<ReconcileResult, ControllerError>;
}

/// Runs one reconcile for the key.
pub async fn reconcile<R: TwoPhaseReconciler>(
    reconciler: &R,
    key: &ObjectKey,
) -> Result<ReconcileResult, ControllerError> {
    let mut state = reconciler.new_state(key);
    state.reload().await?;

    if !state.should_reconcile() {
        debug!("Nothing to reconcile for {}", key);
        return Ok(ReconcileResult::done());
    }

    let mut result = ReconcileResult::done();
    let sync_err = match reconciler.sync(&mut state).await {
        Ok(r) => {
            result = r;
            None
        }
        Err(e) => {
            error!("Sync failed for {}: {}", key, e);
            Some(e)
        }
    };
    state.apply_sync().await?;

    match reconciler.update_status(&mut state).await {
        Ok(r) if !r.is_empty() => result = r,
        Ok(_) => {}
        Err(e) => {
            error!("Status update failed for {}: {}", key, e);
            state.apply_update_status().await?;
            return Err(sync_err.unwrap_or(e));
        }
    }
    state.apply_update_status().await?;

    match sync_err {
        Some(e) => Err(e),
        None => Ok(result),
    }
}
