//! Copy of a VirtualDiskSnapshot
//!
//! A PVC is first restored from the snapshot's VolumeSnapshot; once it is
//! bound its data is copied like any other PVC.

use kube::runtime::events::EventType;
use tracing::warn;

use crds::conditions::ConditionStatus;
use crds::conditions::image::ReadyReason;
use crds::volume_snapshot::VolumeSnapshot;
use crds::VirtualDiskSnapshot;

use crate::context::Context;
use crate::error::ControllerError;
use crate::meta;
use crate::provisionable::{Phase, Provisionable};
use crate::reconciler::ReconcileResult;
use crate::service::disk;
use crate::service::importer::ImportOrigin;
use crate::service::recorder::{object_ref, reasons};
use crate::source::errors::SourceError;
use crate::source::{dvcr_import, is_ready, pvc, quota_requeue, set_ready};
use crate::store::ObjectKey;

use super::supplements_in;

const MSG_WAIT_FOR_RESTORE: &str = "Waiting for the PVC restored from the snapshot to be bound.";

pub(super) async fn sync<K: Provisionable>(
    ctx: &Context,
    obj: &mut K,
    snapshot: &VirtualDiskSnapshot,
) -> Result<ReconcileResult, ControllerError> {
    let key = ObjectKey::of(snapshot);
    let namespace = key.namespace.clone().unwrap_or_default();
    let sup = supplements_in(&*obj, &namespace);
    let disks = ctx.disks();

    if is_ready(obj) {
        if obj.is_stored_on_pvc() {
            let own = obj.supplements(&ctx.settings.controller_namespace);
            return pvc::keep_ready_on_pvc(ctx, obj, &own).await;
        }
        let result = dvcr_import::keep_ready_in_dvcr(ctx, obj, &sup).await?;
        if obj.should_clean_up_supplements() {
            disks.clean_up(&sup).await?;
        }
        return Ok(result);
    }

    let restored = match disks.get_pvc_by_key(&sup.restored_pvc()).await? {
        Some(pvc) => pvc,
        None => {
            let name = snapshot
                .status
                .as_ref()
                .map(|s| s.volume_snapshot_name.clone())
                .unwrap_or_default();
            let volume_snapshot: Option<VolumeSnapshot> = ctx.store.get(Some(&namespace), &name).await?;
            let Some(volume_snapshot) = volume_snapshot.filter(VolumeSnapshot::is_ready_to_use) else {
                return Err(SourceError::VirtualDiskSnapshotNotReady(key.to_string()).into());
            };
            let pvc = match disks
                .restore_pvc_from_snapshot(&volume_snapshot, &sup, meta::controller_reference(&*obj))
                .await
            {
                Ok(pvc) => pvc,
                Err(e) if e.is_quota_exceeded() => {
                    warn!("Restore of {} blocked by quota: {}", sup.restored_pvc(), e);
                    set_ready(obj, ConditionStatus::False, ReadyReason::QuotaExceeded, &e.to_string());
                    return Ok(quota_requeue(&*obj));
                }
                Err(e) => return Err(e.into()),
            };
            ctx.recorder
                .publish(
                    &object_ref(&*obj),
                    EventType::Normal,
                    reasons::PROVISIONING,
                    format!("Restoring PVC from VolumeSnapshot {name}."),
                )
                .await;
            pvc
        }
    };

    if !disk::is_pvc_bound(&restored) {
        obj.set_phase(Phase::Provisioning);
        set_ready(obj, ConditionStatus::False, ReadyReason::Provisioning, MSG_WAIT_FOR_RESTORE);
        return Ok(ReconcileResult::requeue());
    }

    if obj.is_stored_on_pvc() {
        return pvc::sync_clone(ctx, obj, &restored).await;
    }
    let origin = ImportOrigin::BlockDevice {
        pvc_name: sup.restored_pvc().name,
    };
    dvcr_import::sync_to_dvcr_in(ctx, obj, &sup, &origin).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::test_utils::{create_test_vi, test_context};
    use crds::conditions::find_condition;
    use crds::volume_snapshot::{VolumeSnapshotSpec, VolumeSnapshotStatus};
    use crds::{VirtualDiskSnapshotSpec, VirtualDiskSnapshotStatus, VirtualDiskSnapshotPhase};
    use k8s_openapi::api::core::v1::PersistentVolumeClaim;

    fn snapshot() -> VirtualDiskSnapshot {
        let mut snapshot = VirtualDiskSnapshot::new(
            "snap",
            VirtualDiskSnapshotSpec {
                virtual_disk_name: "root".to_string(),
            },
        );
        snapshot.metadata.namespace = Some("default".to_string());
        snapshot.status = Some(VirtualDiskSnapshotStatus {
            phase: VirtualDiskSnapshotPhase::Ready,
            volume_snapshot_name: "vs-root".to_string(),
            conditions: Vec::new(),
        });
        snapshot
    }

    fn volume_snapshot() -> VolumeSnapshot {
        let mut vs = VolumeSnapshot::new("vs-root", VolumeSnapshotSpec::default());
        vs.metadata.namespace = Some("default".to_string());
        vs.status = Some(VolumeSnapshotStatus {
            ready_to_use: Some(true),
            restore_size: Some("5Gi".to_string()),
        });
        vs
    }

    #[tokio::test]
    async fn test_restores_then_waits_for_bind() {
        let (ctx, backend, _) = test_context();
        backend.seed(&volume_snapshot());
        let mut vi = create_test_vi("copy", "default");

        let result = sync(&ctx, &mut vi, &snapshot()).await.unwrap();

        assert!(result.requeue);
        assert_eq!(vi.phase(), Phase::Provisioning);
        let sup = supplements_in(&vi, "default");
        let restored: PersistentVolumeClaim = ctx.store.get_by_key(&sup.restored_pvc()).await.unwrap().unwrap();
        let requests = restored.spec.unwrap().resources.unwrap().requests.unwrap();
        assert_eq!(requests["storage"].0, "5Gi");
        assert_eq!(backend.count("Pod"), 0);
    }

    #[tokio::test]
    async fn test_restore_blocked_by_quota_waits() {
        let (ctx, backend, _) = test_context();
        backend.seed(&volume_snapshot());
        backend.exceed_quota("PersistentVolumeClaim");
        let mut vi = create_test_vi("copy", "default");

        let result = sync(&ctx, &mut vi, &snapshot()).await.unwrap();

        assert_eq!(result.requeue_after, Some(Duration::from_secs(5)));
        let ready = find_condition(vi.conditions(), "Ready").unwrap();
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, "QuotaExceeded");
        assert!(ready.message.contains("exceeded quota"));
        assert_eq!(backend.count("PersistentVolumeClaim"), 0);
    }

    #[tokio::test]
    async fn test_unready_volume_snapshot_fails_validation() {
        let (ctx, backend, _) = test_context();
        let mut vs = volume_snapshot();
        vs.status = None;
        backend.seed(&vs);
        let mut vi = create_test_vi("copy", "default");

        let err = sync(&ctx, &mut vi, &snapshot()).await.unwrap_err();

        assert!(matches!(err, ControllerError::Source(SourceError::VirtualDiskSnapshotNotReady(_))));
    }
}
