//! Provisioning onto a PVC
//!
//! VirtualDisks and VirtualImages stored on a PVC are filled by a DataVolume.
//! The DataVolume reads either the DVCR image written by the importer (the
//! importer stage reports 0-50%, the DataVolume 50-100%) or clones another
//! PVC directly.

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::runtime::events::EventType;

use crds::cdi::DataVolume;
use crds::conditions::ConditionStatus;
use crds::conditions::image::ReadyReason;

use super::dvcr_import::{PodStep, run_importer};
use super::{failure_message, is_ready, quota_requeue, set_ready};
use crate::context::Context;
use crate::error::ControllerError;
use crate::meta;
use crate::provisionable::{Phase, Provisionable};
use crate::reconciler::ReconcileResult;
use crate::service::disk::{self, DiskOrigin, DiskSettings};
use crate::service::importer::ImportOrigin;
use crate::service::recorder::{object_ref, reasons};
use crate::service::stat::{self, ProgressScale};
use crate::service::supplements::Supplements;

pub(crate) const MSG_PROVISIONING_TO_PVC: &str = "Import is in the process of provisioning to PVC.";
pub(crate) const MSG_PVC_NOT_FOUND: &str = "PVC not found: waiting for creation.";
const MSG_WAIT_FOR_FIRST_CONSUMER: &str =
    "Provisioning waits for the first consumer of the PVC: attach the disk to a virtual machine.";

pub(crate) const IMPORTER_STAGE: ProgressScale = ProgressScale { low: 0.0, high: 50.0 };
const DATA_VOLUME_STAGE: ProgressScale = ProgressScale { low: 50.0, high: 100.0 };

fn disk_settings<K: Provisionable>(obj: &K, unpacked_bytes: &str) -> DiskSettings {
    let size = obj
        .requested_size()
        .map(str::to_string)
        .or_else(|| (!unpacked_bytes.is_empty() && unpacked_bytes != "0").then(|| unpacked_bytes.to_string()));
    DiskSettings {
        size,
        storage_class: obj.storage_class().map(str::to_string),
    }
}

async fn start_data_volume<K: Provisionable>(
    ctx: &Context,
    obj: &mut K,
    sup: &Supplements,
    origin: &DiskOrigin,
    settings: &DiskSettings,
) -> Result<ReconcileResult, ControllerError> {
    match ctx.disks().start(origin, settings, sup, meta::controller_reference(&*obj)).await {
        Ok(()) => {
            obj.set_phase(Phase::Provisioning);
            set_ready(obj, ConditionStatus::False, ReadyReason::Provisioning, MSG_PROVISIONING_TO_PVC);
            obj.set_target_pvc(sup.data_volume().name);
            Ok(ReconcileResult::requeue())
        }
        Err(e) if e.is_quota_exceeded() => {
            set_ready(obj, ConditionStatus::False, ReadyReason::QuotaExceeded, &e.to_string());
            Ok(quota_requeue(&*obj))
        }
        Err(e) => {
            obj.set_phase(Phase::Failed);
            set_ready(obj, ConditionStatus::False, ReadyReason::ProvisioningFailed, &failure_message(&e));
            Err(e.into())
        }
    }
}

/// Keeps a Ready object Ready while its PVC exists.
pub(crate) async fn keep_ready_on_pvc<K: Provisionable>(
    ctx: &Context,
    obj: &mut K,
    sup: &Supplements,
) -> Result<ReconcileResult, ControllerError> {
    let pvc = ctx.disks().get_pvc(sup).await?;
    match pvc {
        Some(pvc) if !disk::is_pvc_lost(&pvc) => {
            obj.set_phase(Phase::Ready);
            if let Some(capacity) = disk::get_capacity(&pvc) {
                obj.set_capacity(capacity);
            }
        }
        _ => {
            obj.set_phase(Phase::PvcLost);
            let message = format!("PVC {} not found or lost.", sup.data_volume());
            set_ready(obj, ConditionStatus::False, ReadyReason::PVCLost, &message);
            return Ok(ReconcileResult::done());
        }
    }

    if obj.should_clean_up_supplements() {
        ctx.importer().clean_up(sup).await?;
        ctx.uploader().clean_up(sup).await?;
    }
    Ok(ReconcileResult::done())
}

/// Follows the DataVolume until its PVC is bound and filled.
pub(crate) async fn track_data_volume<K: Provisionable>(
    ctx: &Context,
    obj: &mut K,
    sup: &Supplements,
    dv: &DataVolume,
) -> Result<ReconcileResult, ControllerError> {
    let disks = ctx.disks();
    obj.set_target_pvc(sup.data_volume().name);

    if dv.is_failed() {
        obj.set_phase(Phase::Failed);
        let message = format!("DataVolume {} failed.", sup.data_volume());
        set_ready(obj, ConditionStatus::False, ReadyReason::ProvisioningFailed, &message);
        return Ok(ReconcileResult::done());
    }

    if disk::is_wait_for_first_consumer(dv) {
        obj.set_phase(Phase::WaitForFirstConsumer);
        set_ready(obj, ConditionStatus::False, ReadyReason::WaitingForFirstConsumer, MSG_WAIT_FOR_FIRST_CONSUMER);
        return Ok(ReconcileResult::requeue());
    }

    let Some(pvc) = disks.get_pvc(sup).await? else {
        obj.set_phase(Phase::Provisioning);
        set_ready(obj, ConditionStatus::False, ReadyReason::Provisioning, MSG_PVC_NOT_FOUND);
        return Ok(ReconcileResult::requeue());
    };

    if disk::is_pvc_lost(&pvc) {
        obj.set_phase(Phase::PvcLost);
        let message = format!("PVC {} is lost.", sup.data_volume());
        set_ready(obj, ConditionStatus::False, ReadyReason::PVCLost, &message);
        return Ok(ReconcileResult::done());
    }

    if dv.is_succeeded() && disk::is_pvc_bound(&pvc) {
        complete_on_pvc(obj, &pvc);
        disks.protect(None, Some(&pvc)).await?;
        ctx.recorder
            .publish(&object_ref(&*obj), EventType::Normal, reasons::READY, "Import finished.".to_string())
            .await;
        return Ok(ReconcileResult::requeue());
    }

    obj.set_phase(Phase::Provisioning);
    set_ready(obj, ConditionStatus::False, ReadyReason::Provisioning, MSG_PROVISIONING_TO_PVC);
    if let Some(percent) = disk::get_data_volume_progress(dv) {
        obj.set_progress(format!("{:.1}%", DATA_VOLUME_STAGE.apply(percent)));
    }
    disks.protect(Some(dv), Some(&pvc)).await?;
    Ok(ReconcileResult::requeue())
}

fn complete_on_pvc<K: Provisionable>(obj: &mut K, pvc: &PersistentVolumeClaim) {
    obj.set_phase(Phase::Ready);
    set_ready(obj, ConditionStatus::True, ReadyReason::Ready, "");
    obj.set_progress("100%".to_string());
    if let Some(capacity) = disk::get_capacity(pvc) {
        obj.set_capacity(capacity);
    }
    if let Some(class) = pvc.spec.as_ref().and_then(|s| s.storage_class_name.clone()) {
        obj.set_storage_class_name(class);
    }
}

/// Fills the PVC from the DVCR image written by a completed Pod.
pub(crate) async fn start_from_dvcr<K: Provisionable>(
    ctx: &Context,
    obj: &mut K,
    sup: &Supplements,
    pod: &Pod,
) -> Result<ReconcileResult, ControllerError> {
    obj.set_progress("50.0%".to_string());
    let image = stat::get_dvcr_image_name(pod);
    let size = stat::get_size(pod)?;
    let settings = disk_settings(&*obj, &size.unpacked_bytes);
    start_data_volume(ctx, obj, sup, &DiskOrigin::Dvcr { image }, &settings).await
}

/// Imports `origin` into DVCR, then fills the PVC from the DVCR image.
pub(crate) async fn sync_through_dvcr<K: Provisionable>(
    ctx: &Context,
    obj: &mut K,
    origin: &ImportOrigin,
) -> Result<ReconcileResult, ControllerError> {
    let sup = obj.supplements(&ctx.settings.controller_namespace);
    if is_ready(obj) {
        return keep_ready_on_pvc(ctx, obj, &sup).await;
    }

    if let Some(dv) = ctx.disks().get_data_volume(&sup).await? {
        return track_data_volume(ctx, obj, &sup, &dv).await;
    }

    match run_importer(ctx, obj, &sup, origin, IMPORTER_STAGE).await? {
        PodStep::Complete(pod) => start_from_dvcr(ctx, obj, &sup, &pod).await,
        PodStep::Running(_) => Ok(ReconcileResult::requeue()),
        PodStep::Wait(result) => Ok(result),
    }
}

/// Fills the PVC from `origin` with a DataVolume, without an importer stage.
pub(crate) async fn sync_data_volume<K: Provisionable>(
    ctx: &Context,
    obj: &mut K,
    origin: &DiskOrigin,
    size_hint: &str,
) -> Result<ReconcileResult, ControllerError> {
    let sup = obj.supplements(&ctx.settings.controller_namespace);
    if is_ready(obj) {
        return keep_ready_on_pvc(ctx, obj, &sup).await;
    }

    if let Some(dv) = ctx.disks().get_data_volume(&sup).await? {
        return track_data_volume(ctx, obj, &sup, &dv).await;
    }

    obj.set_progress("0%".to_string());
    let settings = disk_settings(&*obj, size_hint);
    start_data_volume(ctx, obj, &sup, origin, &settings).await
}

/// Fills the PVC by cloning the PVC `source`.
pub(crate) async fn sync_clone<K: Provisionable>(
    ctx: &Context,
    obj: &mut K,
    source: &PersistentVolumeClaim,
) -> Result<ReconcileResult, ControllerError> {
    let capacity = disk::get_capacity(source).unwrap_or_default();
    let origin = DiskOrigin::Pvc(crate::store::ObjectKey::of(source));
    sync_data_volume(ctx, obj, &origin, &capacity).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::importer::IMPORTER_CONTAINER;
    use crate::test_utils::{create_test_vd, set_pod_phase, set_termination_message, test_context};
    use crds::DiskPhase;
    use crds::cdi::DataVolumeStatus;
    use k8s_openapi::api::core::v1::PersistentVolumeClaimStatus;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;

    fn origin() -> ImportOrigin {
        ImportOrigin::Registry {
            image: "registry.example.com/ubuntu:22.04".to_string(),
            pull_secret: None,
            ca_bundle: None,
        }
    }

    #[tokio::test]
    async fn test_disk_goes_through_dvcr_then_data_volume() {
        let (ctx, backend, _) = test_context();
        let mut vd = create_test_vd("root", "default");
        let sup = vd.supplements(&ctx.settings.controller_namespace);

        sync_through_dvcr(&ctx, &mut vd, &origin()).await.unwrap();
        assert_eq!(backend.count("Pod"), 1);
        assert_eq!(backend.count("DataVolume"), 0);

        let mut pod: Pod = ctx.store.get_by_key(&sup.importer_pod()).await.unwrap().unwrap();
        set_pod_phase(&mut pod, "Succeeded");
        set_termination_message(&mut pod, IMPORTER_CONTAINER, r#"{"unpackedSizeBytes":4096}"#);
        backend.seed(&pod);

        sync_through_dvcr(&ctx, &mut vd, &origin()).await.unwrap();
        assert_eq!(backend.count("DataVolume"), 1);
        assert_eq!(vd.progress(), "50.0%");
        assert_eq!(vd.status.as_ref().unwrap().target.pvc_name, sup.data_volume().name);

        let mut dv: DataVolume = ctx.store.get_by_key(&sup.data_volume()).await.unwrap().unwrap();
        assert_eq!(dv.spec.pvc.resources.requests.get("storage").map(String::as_str), Some("10Gi"));
        dv.status = Some(DataVolumeStatus {
            phase: "ImportInProgress".to_string(),
            progress: "50%".to_string(),
            ..Default::default()
        });
        backend.seed(&dv);
        backend.seed(&bound_pvc(&sup));

        sync_through_dvcr(&ctx, &mut vd, &origin()).await.unwrap();
        assert_eq!(vd.status.as_ref().unwrap().phase, DiskPhase::Provisioning);
        assert_eq!(vd.progress(), "75.0%");

        let mut dv: DataVolume = ctx.store.get_by_key(&sup.data_volume()).await.unwrap().unwrap();
        dv.status = Some(DataVolumeStatus {
            phase: "Succeeded".to_string(),
            progress: "100%".to_string(),
            ..Default::default()
        });
        backend.seed(&dv);

        sync_through_dvcr(&ctx, &mut vd, &origin()).await.unwrap();
        let status = vd.status.as_ref().unwrap();
        assert_eq!(status.phase, DiskPhase::Ready);
        assert_eq!(status.capacity, "10Gi");
        assert!(is_ready(&vd));
    }

    #[tokio::test]
    async fn test_wait_for_first_consumer() {
        let (ctx, backend, _) = test_context();
        let mut vd = create_test_vd("root", "default");
        let sup = vd.supplements(&ctx.settings.controller_namespace);
        let dv = DataVolume {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some(sup.data_volume().name),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Default::default(),
            status: Some(DataVolumeStatus {
                phase: "WaitForFirstConsumer".to_string(),
                ..Default::default()
            }),
        };
        backend.seed(&dv);

        sync_through_dvcr(&ctx, &mut vd, &origin()).await.unwrap();

        assert_eq!(vd.status.as_ref().unwrap().phase, DiskPhase::WaitForFirstConsumer);
    }

    #[tokio::test]
    async fn test_ready_disk_without_pvc_is_lost() {
        let (ctx, _, _) = test_context();
        let mut vd = create_test_vd("root", "default");
        vd.set_phase(Phase::Ready);
        set_ready(&mut vd, ConditionStatus::True, ReadyReason::Ready, "");

        sync_through_dvcr(&ctx, &mut vd, &origin()).await.unwrap();

        assert_eq!(vd.status.as_ref().unwrap().phase, DiskPhase::PvcLost);
    }

    fn bound_pvc(sup: &Supplements) -> PersistentVolumeClaim {
        let key = sup.data_volume();
        PersistentVolumeClaim {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some(key.name),
                namespace: key.namespace,
                ..Default::default()
            },
            spec: None,
            status: Some(PersistentVolumeClaimStatus {
                phase: Some("Bound".to_string()),
                capacity: Some(BTreeMap::from([("storage".to_string(), Quantity("10Gi".to_string()))])),
                ..Default::default()
            }),
        }
    }
}
