//! Copy of an image stored in DVCR.

use crds::ImageStatus;

use crate::context::Context;
use crate::error::ControllerError;
use crate::provisionable::Provisionable;
use crate::reconciler::ReconcileResult;
use crate::service::disk::DiskOrigin;
use crate::service::importer::ImportOrigin;
use crate::source::errors::SourceError;
use crate::source::{dvcr_import, pvc};

/// Copies the referenced DVCR image: registry to registry for DVCR
/// targets, straight into a DataVolume for PVC targets.
pub(super) async fn sync<K: Provisionable>(
    ctx: &Context,
    obj: &mut K,
    referenced: ImageStatus,
) -> Result<ReconcileResult, ControllerError> {
    let image = referenced.target.registry_url;
    if image.is_empty() {
        return Err(SourceError::InvalidDataSource("referenced image has no registry URL".to_string()).into());
    }

    if obj.is_stored_on_pvc() {
        let origin = DiskOrigin::Dvcr { image };
        pvc::sync_data_volume(ctx, obj, &origin, &referenced.size.unpacked_bytes).await
    } else {
        dvcr_import::sync_to_dvcr(ctx, obj, &ImportOrigin::Dvcr { image }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_cvi, create_test_vd, test_context};
    use crds::cdi::DataVolume;
    use k8s_openapi::api::core::v1::Pod;

    fn dvcr_image() -> ImageStatus {
        let mut status = ImageStatus::default();
        status.target.registry_url = "dvcr.d8-virtualization.svc/cvi/ubuntu:uid".to_string();
        status.size.unpacked_bytes = "2147483648".to_string();
        status
    }

    #[tokio::test]
    async fn test_dvcr_target_copies_with_importer() {
        let (ctx, backend, _) = test_context();
        let mut cvi = create_test_cvi("copy");

        sync(&ctx, &mut cvi, dvcr_image()).await.unwrap();

        assert_eq!(backend.count("Pod"), 1);
        let sup = cvi.supplements(&ctx.settings.controller_namespace);
        let pod: Pod = ctx.store.get_by_key(&sup.importer_pod()).await.unwrap().unwrap();
        let envs = pod.spec.unwrap().containers[0].env.clone().unwrap();
        assert!(envs.iter().any(|e| e.value.as_deref() == Some("dvcr")));
    }

    #[tokio::test]
    async fn test_pvc_target_reads_dvcr_directly() {
        let (ctx, backend, _) = test_context();
        let mut vd = create_test_vd("root", "default");
        vd.spec.persistent_volume_claim.size = None;

        sync(&ctx, &mut vd, dvcr_image()).await.unwrap();

        assert_eq!(backend.count("Pod"), 0);
        let sup = vd.supplements(&ctx.settings.controller_namespace);
        let dv: DataVolume = ctx.store.get_by_key(&sup.data_volume()).await.unwrap().unwrap();
        let registry = dv.spec.source.registry.unwrap();
        assert_eq!(registry.url, "docker://dvcr.d8-virtualization.svc/cvi/ubuntu:uid");
        assert_eq!(dv.spec.pvc.resources.requests.get("storage").map(String::as_str), Some("2147483648"));
    }
}
