//! Reconciler of ClusterVirtualImage, VirtualImage and VirtualDisk
//!
//! One generic reconciler runs the handler chain of the kind against the
//! changed copy of the object. The chain changes finalizers and status; both
//! are persisted by the two-phase core.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crds::conditions::find_condition;
use crds::conditions::image::ConditionType;
use crds::{ClusterVirtualImage, VirtualDisk, VirtualImage};

use crate::context::Context;
use crate::error::ControllerError;
use crate::handler::attachee::device_key;
use crate::handler::{
    AttacheeHandler, DatasourceReadyHandler, DeletionHandler, ImagePresenceHandler, InUseHandler, LifeCycleHandler,
    PostponeHandler,
};
use crate::meta;
use crate::provisionable::{Phase, Provisionable};
use crate::reconciler::chain::Chain;
use crate::reconciler::resource::Resource;
use crate::reconciler::{ReconcileResult, ReconcilerState, TwoPhaseReconciler};
use crate::service::disk;
use crate::source::{Sources, all_sources};
use crate::store::ObjectKey;

/// State of one reconcile of a provisionable object.
#[derive(Debug)]
pub struct ProvisioningState<K: Provisionable> {
    ctx: Arc<Context>,
    resource: Resource<K>,
    tracks_usage: bool,
    supplements_alive: bool,
}

impl<K: Provisionable> ProvisioningState<K> {
    /// Fetched and working copy of the object.
    pub fn resource(&self) -> &Resource<K> {
        &self.resource
    }
}

#[async_trait]
impl<K: Provisionable> ReconcilerState for ProvisioningState<K> {
    async fn reload(&mut self) -> Result<(), ControllerError> {
        self.resource.fetch().await?;
        self.supplements_alive = match self.resource.current() {
            Some(obj) if obj.phase() == Phase::Ready && !meta::is_deleting(obj) => {
                has_live_supplements(&self.ctx, obj).await?
            }
            _ => false,
        };
        Ok(())
    }

    fn should_reconcile(&self) -> bool {
        let Some(obj) = self.resource.current() else {
            return false;
        };
        if meta::is_deleting(obj) {
            return true;
        }
        let protected = meta::has_finalizer(obj, K::PROTECTION_FINALIZER);
        if protected != self.ctx.index.is_used(&device_key(obj)) {
            return true;
        }
        let settled = find_condition(obj.conditions(), ConditionType::Ready.as_str())
            .is_some_and(|c| c.observed_generation == meta::generation(obj));
        if !settled || !meta::has_finalizer(obj, K::CLEANUP_FINALIZER) {
            return true;
        }
        match obj.phase() {
            // Lost is final: supplements went away when the object became Ready.
            Phase::Lost => false,
            // Images stay in the loop for the presence check and their InUse condition.
            Phase::Ready => self.tracks_usage || self.supplements_alive,
            _ => true,
        }
    }

    async fn apply_sync(&mut self) -> Result<(), ControllerError> {
        self.resource.update_meta().await?;
        Ok(())
    }

    async fn apply_update_status(&mut self) -> Result<(), ControllerError> {
        self.resource.update_status().await?;
        Ok(())
    }
}

/// Returns true while a Ready object still has provisioning Pods, or its PVC
/// is gone.
async fn has_live_supplements<K: Provisionable>(ctx: &Context, obj: &K) -> Result<bool, ControllerError> {
    let sup = obj.supplements(&ctx.settings.controller_namespace);
    if ctx.importer().get_pod(&sup).await?.is_some() || ctx.uploader().get_pod(&sup).await?.is_some() {
        return Ok(true);
    }
    if !obj.is_stored_on_pvc() {
        return Ok(false);
    }
    let pvc = ctx.disks().get_pvc(&sup).await?;
    Ok(pvc.is_none_or(|pvc| disk::is_pvc_lost(&pvc)))
}

/// Reconciles one provisionable kind through its handler chain.
pub struct ProvisioningReconciler<K: Provisionable> {
    ctx: Arc<Context>,
    chain: Chain<K>,
    tracks_usage: bool,
}

impl<K: Provisionable> std::fmt::Debug for ProvisioningReconciler<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningReconciler")
            .field("kind", &K::kind(&()))
            .field("chain", &self.chain)
            .field("tracks_usage", &self.tracks_usage)
            .finish_non_exhaustive()
    }
}

/// Handlers shared by every kind, up to and including provisioning.
fn base_chain<K: Provisionable>(ctx: &Arc<Context>, sources: &Arc<Sources<K>>) -> Chain<K> {
    Chain::new()
        .with(DeletionHandler::new(Arc::clone(sources)))
        .with(AttacheeHandler::new(Arc::clone(ctx)))
        .with(PostponeHandler::new(Arc::clone(ctx)))
        .with(DatasourceReadyHandler::new(Arc::clone(sources)))
        .with(LifeCycleHandler::new(Arc::clone(sources)))
}

/// Chain of the image kinds: provisioning, then presence in DVCR and usage.
fn image_chain<K: Provisionable>(ctx: &Arc<Context>) -> Chain<K> {
    let sources = Arc::new(all_sources(ctx));
    base_chain(ctx, &sources)
        .with(ImagePresenceHandler::new(Arc::clone(ctx)))
        .with(InUseHandler::new(Arc::clone(ctx)))
}

impl ProvisioningReconciler<ClusterVirtualImage> {
    /// Creates the ClusterVirtualImage reconciler.
    pub fn new(ctx: Arc<Context>) -> Self {
        let chain = image_chain(&ctx);
        Self {
            ctx,
            chain,
            tracks_usage: true,
        }
    }
}

impl ProvisioningReconciler<VirtualImage> {
    /// Creates the VirtualImage reconciler.
    pub fn new(ctx: Arc<Context>) -> Self {
        let chain = image_chain(&ctx);
        Self {
            ctx,
            chain,
            tracks_usage: true,
        }
    }
}

impl ProvisioningReconciler<VirtualDisk> {
    /// Creates the VirtualDisk reconciler.
    pub fn new(ctx: Arc<Context>) -> Self {
        let sources = Arc::new(all_sources(&ctx));
        let chain = base_chain(&ctx, &sources);
        Self {
            ctx,
            chain,
            tracks_usage: false,
        }
    }
}

#[async_trait]
impl<K: Provisionable> TwoPhaseReconciler for ProvisioningReconciler<K> {
    type State = ProvisioningState<K>;

    fn new_state(&self, key: &ObjectKey) -> Self::State {
        ProvisioningState {
            ctx: Arc::clone(&self.ctx),
            resource: Resource::new(key.clone(), self.ctx.store.clone()),
            tracks_usage: self.tracks_usage,
            supplements_alive: false,
        }
    }

    async fn sync(&self, state: &mut Self::State) -> Result<ReconcileResult, ControllerError> {
        let key = state.resource.key().clone();
        let Some(obj) = state.resource.changed_mut() else {
            return Ok(ReconcileResult::done());
        };
        info!("Reconciling {} {}", K::kind(&()), key);
        self.chain.run(obj).await
    }

    async fn update_status(&self, _state: &mut Self::State) -> Result<ReconcileResult, ControllerError> {
        Ok(ReconcileResult::done())
    }
}
