//! Upload data source
//!
//! Starts an uploader Pod behind a Service and an Ingress, publishes the
//! upload URL and waits for the user to send the data.

use std::sync::Arc;

use async_trait::async_trait;
use kube::runtime::events::EventType;
use tracing::warn;

use crds::ImageUploadUrls;
use crds::conditions::ConditionStatus;
use crds::conditions::image::ReadyReason;

use super::dvcr_import::{PodStep, complete_in_dvcr, keep_ready_in_dvcr, observe_pod};
use super::{Source, failure_message, is_ready, pvc, quota_requeue, set_ready};
use crate::context::Context;
use crate::error::ControllerError;
use crate::provisionable::{Phase, Provisionable};
use crate::reconciler::ReconcileResult;
use crate::service::importer::PodSettings;
use crate::service::recorder::{object_ref, reasons};
use crate::service::stat::{self, ProgressScale};
use crate::service::uploader::{external_url, is_uploader_ready, upload_command};

const MSG_UPLOADER_NOT_READY: &str = "Waiting for the uploader to be ready to process the user's upload.";
const MSG_WAIT_FOR_UPLOAD: &str = "Waiting for the user upload.";
const MSG_UPLOADING_TO_DVCR: &str = "Upload is in the process of provisioning to DVCR.";

/// Receives data uploaded by the user.
#[derive(Debug, Clone)]
pub struct UploadSource {
    ctx: Arc<Context>,
}

impl UploadSource {
    /// Creates the source.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl<K: Provisionable> Source<K> for UploadSource {
    async fn sync(&self, obj: &mut K) -> Result<ReconcileResult, ControllerError> {
        let ctx = &*self.ctx;
        let sup = obj.supplements(&ctx.settings.controller_namespace);
        let on_pvc = obj.is_stored_on_pvc();

        if is_ready(obj) {
            return if on_pvc {
                pvc::keep_ready_on_pvc(ctx, obj, &sup).await
            } else {
                keep_ready_in_dvcr(ctx, obj, &sup).await
            };
        }
        if on_pvc {
            if let Some(dv) = ctx.disks().get_data_volume(&sup).await? {
                return pvc::track_data_volume(ctx, obj, &sup, &dv).await;
            }
        }

        let uploader = ctx.uploader();
        let pod = uploader.get_pod(&sup).await?;
        let service = uploader.get_service(&sup).await?;
        let ingress = uploader.get_ingress(&sup).await?;

        let Some(pod) = pod else {
            obj.set_progress("0%".to_string());
            let destination = obj.dvcr_image(&ctx.dvcr);
            let settings = PodSettings::for_owner(sup.uploader_pod(), &*obj);
            return match uploader.start(&destination, &sup, &settings).await {
                Ok(()) => {
                    obj.set_phase(Phase::Pending);
                    set_ready(obj, ConditionStatus::False, ReadyReason::ProvisioningNotStarted, MSG_UPLOADER_NOT_READY);
                    Ok(ReconcileResult::requeue())
                }
                Err(e) if e.is_quota_exceeded() => {
                    warn!("Uploader for {} blocked by quota: {}", sup.uploader_pod(), e);
                    set_ready(obj, ConditionStatus::False, ReadyReason::QuotaExceeded, &e.to_string());
                    Ok(quota_requeue(&*obj))
                }
                Err(e) => {
                    obj.set_phase(Phase::Failed);
                    set_ready(obj, ConditionStatus::False, ReadyReason::ProvisioningFailed, &failure_message(&e));
                    Err(e.into())
                }
            };
        };

        let in_flight = !stat::is_pod_complete(&pod) && !stat::is_pod_terminating(&pod);
        if in_flight && !is_uploader_ready(Some(&pod), service.as_ref(), ingress.as_ref()) {
            obj.set_phase(Phase::Pending);
            set_ready(obj, ConditionStatus::False, ReadyReason::ProvisioningNotStarted, MSG_UPLOADER_NOT_READY);
            return Ok(ReconcileResult::requeue());
        }

        if in_flight && !stat::is_upload_started(&pod) {
            let url = ingress.as_ref().and_then(external_url).unwrap_or_default().to_string();
            obj.set_phase(Phase::WaitForUserUpload);
            set_ready(obj, ConditionStatus::False, ReadyReason::WaitForUserUpload, MSG_WAIT_FOR_UPLOAD);
            obj.set_upload_urls(Some(ImageUploadUrls {
                command: upload_command(&url),
                external: url,
            }));
            uploader.protect(&pod).await?;
            return Ok(ReconcileResult::requeue());
        }

        let scale = if on_pvc { pvc::IMPORTER_STAGE } else { ProgressScale::FULL };
        match observe_pod(obj, pod, scale, MSG_UPLOADING_TO_DVCR) {
            PodStep::Complete(pod) if on_pvc => pvc::start_from_dvcr(ctx, obj, &sup, &pod).await,
            PodStep::Complete(pod) => {
                complete_in_dvcr(obj, &pod)?;
                ctx.recorder
                    .publish(&object_ref(&*obj), EventType::Normal, reasons::READY, "Upload finished.".to_string())
                    .await;
                Ok(ReconcileResult::requeue())
            }
            PodStep::Running(pod) => {
                uploader.protect(&pod).await?;
                if !on_pvc {
                    obj.set_target_registry_url(stat::get_dvcr_image_name(&pod));
                }
                Ok(ReconcileResult::requeue())
            }
            PodStep::Wait(result) => Ok(result),
        }
    }

    async fn clean_up(&self, obj: &K) -> Result<bool, ControllerError> {
        let sup = obj.supplements(&self.ctx.settings.controller_namespace);
        let mut requeue = self.ctx.uploader().clean_up(&sup).await?;
        if obj.is_stored_on_pvc() {
            requeue |= self.ctx.disks().clean_up(&sup).await?;
        }
        Ok(requeue)
    }

    async fn validate(&self, _obj: &K) -> Result<(), ControllerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_cvi, set_pod_phase, test_context};
    use crds::ImagePhase;
    use crds::annotations::ANN_IMPORT_PROGRESS;
    use k8s_openapi::api::core::v1::Pod;

    #[tokio::test]
    async fn test_upload_waits_for_user_then_provisions() {
        let (ctx, backend, _) = test_context();
        let source = UploadSource::new(Arc::clone(&ctx));
        let mut cvi = create_test_cvi("ubuntu");
        cvi.spec.data_source = crds::DataSource {
            type_: crds::DataSourceType::Upload,
            ..Default::default()
        };
        let sup = cvi.supplements(&ctx.settings.controller_namespace);

        source.sync(&mut cvi).await.unwrap();
        assert_eq!(backend.count("Pod"), 1);
        assert_eq!(backend.count("Service"), 1);
        assert_eq!(backend.count("Ingress"), 1);
        assert_eq!(cvi.status.as_ref().unwrap().phase, ImagePhase::Pending);

        let mut pod: Pod = ctx.store.get_by_key(&sup.uploader_pod()).await.unwrap().unwrap();
        set_pod_phase(&mut pod, "Running");
        backend.seed(&pod);

        source.sync(&mut cvi).await.unwrap();
        let status = cvi.status.as_ref().unwrap();
        assert_eq!(status.phase, ImagePhase::WaitForUserUpload);
        let urls = status.image_upload_urls.as_ref().unwrap();
        assert!(urls.external.starts_with("https://"));
        assert_eq!(urls.command, format!("curl {} -T example.iso", urls.external));

        let mut pod: Pod = ctx.store.get_by_key(&sup.uploader_pod()).await.unwrap().unwrap();
        crate::meta::set_annotation(&mut pod, ANN_IMPORT_PROGRESS, "10");
        backend.seed(&pod);

        source.sync(&mut cvi).await.unwrap();
        assert_eq!(cvi.status.as_ref().unwrap().phase, ImagePhase::Provisioning);
        assert_eq!(cvi.progress(), "10.0%");
    }
}
