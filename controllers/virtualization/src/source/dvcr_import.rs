//! Importing into DVCR
//!
//! The first stage of every import. The importer Pod copies the data into
//! the object's DVCR image; while it runs, the status mirrors its progress.
//! Images stored in DVCR are done when the Pod completes.

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::events::EventType;
use tracing::{info, warn};

use crds::conditions::ConditionStatus;
use crds::conditions::image::ReadyReason;

use super::{failure_message, is_ready, quota_requeue, set_ready};
use crate::context::Context;
use crate::error::ControllerError;
use crate::provisionable::{ImportResult, Phase, Provisionable};
use crate::reconciler::ReconcileResult;
use crate::service::importer::{ImportOrigin, PodSettings};
use crate::service::recorder::{object_ref, reasons};
use crate::service::stat::{self, PodCheckError, ProgressScale};
use crate::service::supplements::Supplements;

pub(crate) const MSG_PROVISIONER_NOT_FOUND: &str = "DVCR Provisioner not found: create the new one.";
pub(crate) const MSG_PROVISIONING_TO_DVCR: &str = "Import is in the process of provisioning to DVCR.";

/// Where the provisioning Pod is.
#[derive(Debug)]
pub(crate) enum PodStep {
    /// Pod finished successfully
    Complete(Pod),
    /// Pod copies data; the status reports its progress
    Running(Pod),
    /// Status updated; nothing more to do in this reconcile
    Wait(ReconcileResult),
}

/// Maps the state of a provisioning Pod onto the object's status.
pub(crate) fn observe_pod<K: Provisionable>(obj: &mut K, pod: Pod, scale: ProgressScale, message: &str) -> PodStep {
    if stat::is_pod_terminating(&pod) {
        obj.set_phase(Phase::Pending);
        return PodStep::Wait(ReconcileResult::requeue());
    }

    if stat::is_pod_complete(&pod) {
        if let Err(e) = stat::check_pod(&pod) {
            obj.set_phase(Phase::Failed);
            set_ready(obj, ConditionStatus::False, ReadyReason::ProvisioningFailed, &failure_message(&e));
            return PodStep::Wait(ReconcileResult::done());
        }
        return PodStep::Complete(pod);
    }

    match stat::check_pod(&pod) {
        Err(e @ (PodCheckError::NotInitialized(_) | PodCheckError::NotScheduled(_))) => {
            obj.set_phase(Phase::Provisioning);
            set_ready(obj, ConditionStatus::False, ReadyReason::ProvisioningNotStarted, &failure_message(&e));
            PodStep::Wait(ReconcileResult::requeue())
        }
        Err(e @ PodCheckError::ProvisioningFailed(_)) => {
            obj.set_phase(Phase::Failed);
            set_ready(obj, ConditionStatus::False, ReadyReason::ProvisioningFailed, &failure_message(&e));
            PodStep::Wait(ReconcileResult::done())
        }
        Ok(()) => {
            obj.set_phase(Phase::Provisioning);
            set_ready(obj, ConditionStatus::False, ReadyReason::Provisioning, message);
            let progress = stat::get_progress(&pod, obj.progress(), scale);
            obj.set_progress(progress);
            obj.set_download_speed(stat::get_download_speed(&pod));
            PodStep::Running(pod)
        }
    }
}

/// Starts the importer if needed and observes it.
pub(crate) async fn run_importer<K: Provisionable>(
    ctx: &Context,
    obj: &mut K,
    sup: &Supplements,
    origin: &ImportOrigin,
    scale: ProgressScale,
) -> Result<PodStep, ControllerError> {
    let importer = ctx.importer();

    let Some(pod) = importer.get_pod(sup).await? else {
        obj.set_progress("0%".to_string());
        let destination = obj.dvcr_image(&ctx.dvcr);
        let settings = PodSettings::for_owner(sup.importer_pod(), &*obj);

        return match importer.start(origin, &destination, sup, &settings).await {
            Ok(()) => {
                obj.set_phase(Phase::Provisioning);
                set_ready(obj, ConditionStatus::False, ReadyReason::Provisioning, MSG_PROVISIONER_NOT_FOUND);
                ctx.recorder
                    .publish(
                        &object_ref(&*obj),
                        EventType::Normal,
                        reasons::PROVISIONING,
                        "Import started.".to_string(),
                    )
                    .await;
                Ok(PodStep::Wait(ReconcileResult::requeue()))
            }
            Err(e) if e.is_quota_exceeded() => {
                warn!("Importer for {} blocked by quota: {}", sup.importer_pod(), e);
                set_ready(obj, ConditionStatus::False, ReadyReason::QuotaExceeded, &e.to_string());
                Ok(PodStep::Wait(quota_requeue(&*obj)))
            }
            Err(e) => {
                obj.set_phase(Phase::Failed);
                set_ready(obj, ConditionStatus::False, ReadyReason::ProvisioningFailed, &failure_message(&e));
                ctx.recorder
                    .publish(&object_ref(&*obj), EventType::Warning, reasons::PROVISIONING_FAILED, e.to_string())
                    .await;
                Err(e.into())
            }
        };
    };

    let step = observe_pod(obj, pod, scale, MSG_PROVISIONING_TO_DVCR);
    if let PodStep::Running(pod) = &step {
        importer.protect(pod).await?;
    }
    Ok(step)
}

/// Records the result of a completed Pod and marks the object Ready.
pub(crate) fn complete_in_dvcr<K: Provisionable>(obj: &mut K, pod: &Pod) -> Result<(), ControllerError> {
    obj.set_phase(Phase::Ready);
    set_ready(obj, ConditionStatus::True, ReadyReason::Ready, "");
    obj.set_import_result(ImportResult {
        size: stat::get_size(pod)?,
        format: stat::get_format(pod)?,
        cdrom: stat::get_cdrom(pod)?,
    });
    obj.set_progress("100%".to_string());
    obj.set_target_registry_url(stat::get_dvcr_image_name(pod));
    obj.set_download_speed(stat::get_download_speed(pod));
    Ok(())
}

/// Keeps a Ready image Ready and removes the Pods it no longer needs.
pub(crate) async fn keep_ready_in_dvcr<K: Provisionable>(
    ctx: &Context,
    obj: &mut K,
    sup: &Supplements,
) -> Result<ReconcileResult, ControllerError> {
    obj.set_phase(Phase::Ready);

    let importer = ctx.importer();
    let uploader = ctx.uploader();
    if let Some(pod) = importer.get_pod(sup).await? {
        importer.unprotect(&pod).await?;
    }
    if let Some(pod) = uploader.get_pod(sup).await? {
        uploader.unprotect(&pod).await?;
    }

    if obj.should_clean_up_supplements() {
        importer.clean_up(sup).await?;
        uploader.clean_up(sup).await?;
    }
    Ok(ReconcileResult::done())
}

/// Imports `origin` into the object's DVCR image.
pub(crate) async fn sync_to_dvcr<K: Provisionable>(
    ctx: &Context,
    obj: &mut K,
    origin: &ImportOrigin,
) -> Result<ReconcileResult, ControllerError> {
    let sup = obj.supplements(&ctx.settings.controller_namespace);
    sync_to_dvcr_in(ctx, obj, &sup, origin).await
}

/// Imports `origin` into the object's DVCR image with the importer placed by `sup`.
pub(crate) async fn sync_to_dvcr_in<K: Provisionable>(
    ctx: &Context,
    obj: &mut K,
    sup: &Supplements,
    origin: &ImportOrigin,
) -> Result<ReconcileResult, ControllerError> {
    if is_ready(obj) {
        return keep_ready_in_dvcr(ctx, obj, sup).await;
    }

    match run_importer(ctx, obj, sup, origin, ProgressScale::FULL).await? {
        PodStep::Complete(pod) => {
            complete_in_dvcr(obj, &pod)?;
            info!("Import into {} finished", obj.target_registry_url());
            ctx.recorder
                .publish(&object_ref(&*obj), EventType::Normal, reasons::READY, "Import finished.".to_string())
                .await;
            Ok(ReconcileResult::requeue())
        }
        PodStep::Running(pod) => {
            obj.set_target_registry_url(stat::get_dvcr_image_name(&pod));
            Ok(ReconcileResult::requeue())
        }
        PodStep::Wait(result) => Ok(result),
    }
}

/// Imports `origin` into DVCR, then into the object's PVC.
pub(crate) async fn sync<K: Provisionable>(
    ctx: &Context,
    obj: &mut K,
    origin: &ImportOrigin,
) -> Result<ReconcileResult, ControllerError> {
    if obj.is_stored_on_pvc() {
        super::pvc::sync_through_dvcr(ctx, obj, origin).await
    } else {
        sync_to_dvcr(ctx, obj, origin).await
    }
}

/// Removes the importer Pod and what was copied next to it.
pub(crate) async fn clean_up<K: Provisionable>(ctx: &Context, obj: &K) -> Result<bool, ControllerError> {
    let sup = obj.supplements(&ctx.settings.controller_namespace);
    let mut requeue = ctx.importer().clean_up(&sup).await?;
    if obj.is_stored_on_pvc() {
        requeue |= ctx.disks().clean_up(&sup).await?;
    }
    Ok(requeue)
}
