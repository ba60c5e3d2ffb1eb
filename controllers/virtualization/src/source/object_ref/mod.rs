//! Object reference data source
//!
//! Copies the data of another image, disk or disk snapshot. How the copy is
//! made depends on where the referenced data lives and where the target
//! keeps its own: DVCR to DVCR, DVCR to PVC, PVC to DVCR through a block
//! device, or PVC to PVC by cloning.

mod image;
mod pvc_ref;
mod vdsnapshot;

use std::sync::Arc;

use async_trait::async_trait;

use crds::{
    BlockDeviceKind, ClusterVirtualImage, DataSourceObjectRef, DiskPhase, ImagePhase, ObjectRefKind, VirtualDisk,
    VirtualDiskSnapshot, VirtualDiskSnapshotPhase, VirtualImage,
};

use super::errors::SourceError;
use super::{Source, dvcr_import};
use crate::context::Context;
use crate::error::ControllerError;
use crate::index::BlockDeviceKey;
use crate::provisionable::Provisionable;
use crate::reconciler::ReconcileResult;
use crate::service::supplements::Supplements;
use crate::store::ObjectKey;

/// Copies data from another virtualization resource.
#[derive(Debug, Clone)]
pub struct ObjectRefSource {
    ctx: Arc<Context>,
}

impl ObjectRefSource {
    /// Creates the source.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

fn object_ref<K: Provisionable>(obj: &K) -> Result<&DataSourceObjectRef, SourceError> {
    obj.data_source()
        .object_ref
        .as_ref()
        .filter(|r| !r.name.is_empty())
        .ok_or_else(|| SourceError::InvalidDataSource("objectRef.name is required".to_string()))
}

/// Key of a namespaced referenced object: namespaced targets only see their own namespace.
pub(crate) fn ref_key<K: Provisionable>(obj: &K, r: &DataSourceObjectRef) -> Result<ObjectKey, SourceError> {
    let namespace = obj
        .meta()
        .namespace
        .clone()
        .or_else(|| r.namespace.clone())
        .filter(|ns| !ns.is_empty())
        .ok_or_else(|| SourceError::InvalidDataSource(format!("objectRef.namespace is required for {}", r.kind.as_str())))?;
    Ok(ObjectKey::namespaced(namespace, r.name.clone()))
}

/// Supplements of `obj` placed next to a PVC in `namespace`.
fn supplements_in<K: Provisionable>(obj: &K, namespace: &str) -> Supplements {
    Supplements::new(
        K::SHORT_KIND,
        obj.meta().name.as_deref().unwrap_or_default(),
        namespace,
        crate::meta::uid(obj),
    )
}

impl ObjectRefSource {
    async fn ready_cvi(&self, name: &str) -> Result<ClusterVirtualImage, ControllerError> {
        let cvi: Option<ClusterVirtualImage> = self.ctx.store.get(None, name).await?;
        cvi.filter(|c| c.status.as_ref().is_some_and(|s| s.phase == ImagePhase::Ready))
            .ok_or_else(|| SourceError::ClusterImageNotReady(name.to_string()).into())
    }

    async fn ready_vi(&self, key: &ObjectKey) -> Result<VirtualImage, ControllerError> {
        let vi: Option<VirtualImage> = self.ctx.store.get_by_key(key).await?;
        vi.filter(|v| v.status.as_ref().is_some_and(|s| s.phase == ImagePhase::Ready))
            .ok_or_else(|| SourceError::ImageNotReady(key.to_string()).into())
    }

    async fn ready_vd(&self, key: &ObjectKey) -> Result<VirtualDisk, ControllerError> {
        let vd: Option<VirtualDisk> = self.ctx.store.get_by_key(key).await?;
        let phase = vd.as_ref().and_then(|v| v.status.as_ref()).map(|s| s.phase);
        match (vd, phase) {
            (Some(_), Some(DiskPhase::WaitForFirstConsumer)) => {
                Err(SourceError::VirtualDiskNotReadyForUse(key.to_string()).into())
            }
            (Some(vd), Some(DiskPhase::Ready)) => {
                let device = BlockDeviceKey::new(
                    BlockDeviceKind::VirtualDisk,
                    key.namespace.as_deref().unwrap_or_default(),
                    key.name.clone(),
                );
                if self.ctx.index.is_used(&device) {
                    return Err(SourceError::VirtualDiskAttachedToVirtualMachine(key.to_string()).into());
                }
                Ok(vd)
            }
            _ => Err(SourceError::VirtualDiskNotReady(key.to_string()).into()),
        }
    }

    async fn ready_vdsnapshot(&self, key: &ObjectKey) -> Result<VirtualDiskSnapshot, ControllerError> {
        let snapshot: Option<VirtualDiskSnapshot> = self.ctx.store.get_by_key(key).await?;
        snapshot
            .filter(|s| s.status.as_ref().is_some_and(|s| s.phase == VirtualDiskSnapshotPhase::Ready))
            .ok_or_else(|| SourceError::VirtualDiskSnapshotNotReady(key.to_string()).into())
    }

    /// Namespace of the supplements created next to a referenced PVC, if any.
    fn pvc_namespace<K: Provisionable>(obj: &K) -> Option<String> {
        let r = obj.data_source().object_ref.as_ref()?;
        match r.kind {
            ObjectRefKind::ClusterVirtualImage => None,
            ObjectRefKind::VirtualImage | ObjectRefKind::VirtualDisk | ObjectRefKind::VirtualDiskSnapshot => {
                ref_key(obj, r).ok()?.namespace
            }
        }
    }
}

#[async_trait]
impl<K: Provisionable> Source<K> for ObjectRefSource {
    async fn sync(&self, obj: &mut K) -> Result<ReconcileResult, ControllerError> {
        let r = object_ref(&*obj)?.clone();
        let ctx = &*self.ctx;

        match r.kind {
            ObjectRefKind::ClusterVirtualImage => {
                let cvi = self.ready_cvi(&r.name).await?;
                image::sync(ctx, obj, cvi.status.unwrap_or_default()).await
            }
            ObjectRefKind::VirtualImage => {
                let key = ref_key(&*obj, &r)?;
                let vi = self.ready_vi(&key).await?;
                if vi.is_stored_on_pvc() {
                    let pvc = vi.status.map(|s| s.target.pvc_name).unwrap_or_default();
                    pvc_ref::sync(ctx, obj, &ObjectKey::namespaced(key.namespace.unwrap_or_default(), pvc)).await
                } else {
                    image::sync(ctx, obj, vi.status.unwrap_or_default()).await
                }
            }
            ObjectRefKind::VirtualDisk => {
                let key = ref_key(&*obj, &r)?;
                let vd = self.ready_vd(&key).await?;
                let pvc = vd.status.map(|s| s.target.pvc_name).unwrap_or_default();
                pvc_ref::sync(ctx, obj, &ObjectKey::namespaced(key.namespace.unwrap_or_default(), pvc)).await
            }
            ObjectRefKind::VirtualDiskSnapshot => {
                let key = ref_key(&*obj, &r)?;
                let snapshot = self.ready_vdsnapshot(&key).await?;
                vdsnapshot::sync(ctx, obj, &snapshot).await
            }
        }
    }

    async fn clean_up(&self, obj: &K) -> Result<bool, ControllerError> {
        let mut requeue = dvcr_import::clean_up(&self.ctx, obj).await?;
        if let Some(namespace) = Self::pvc_namespace(obj) {
            let sup = supplements_in(obj, &namespace);
            requeue |= self.ctx.importer().clean_up(&sup).await?;
            requeue |= self.ctx.disks().clean_up(&sup).await?;
        }
        Ok(requeue)
    }

    async fn validate(&self, obj: &K) -> Result<(), ControllerError> {
        let r = object_ref(obj)?;
        match r.kind {
            ObjectRefKind::ClusterVirtualImage => {
                self.ready_cvi(&r.name).await?;
            }
            ObjectRefKind::VirtualImage => {
                self.ready_vi(&ref_key(obj, r)?).await?;
            }
            ObjectRefKind::VirtualDisk => {
                if K::BLOCK_DEVICE_KIND == BlockDeviceKind::VirtualDisk {
                    return Err(SourceError::InvalidDataSource(
                        "a VirtualDisk cannot be created from another VirtualDisk".to_string(),
                    )
                    .into());
                }
                self.ready_vd(&ref_key(obj, r)?).await?;
            }
            ObjectRefKind::VirtualDiskSnapshot => {
                self.ready_vdsnapshot(&ref_key(obj, r)?).await?;
            }
        }
        Ok(())
    }
}
