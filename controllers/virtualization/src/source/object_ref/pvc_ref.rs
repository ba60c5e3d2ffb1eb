//! Copy of data kept in a PVC: a VirtualDisk or a VirtualImage stored on a PVC.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;

use crate::context::Context;
use crate::error::ControllerError;
use crate::provisionable::Provisionable;
use crate::reconciler::ReconcileResult;
use crate::service::importer::ImportOrigin;
use crate::source::errors::SourceError;
use crate::source::{dvcr_import, pvc};
use crate::store::ObjectKey;

use super::supplements_in;

/// Clones the PVC for PVC targets; DVCR targets read it as a block device
/// from an importer running next to it.
pub(super) async fn sync<K: Provisionable>(
    ctx: &Context,
    obj: &mut K,
    key: &ObjectKey,
) -> Result<ReconcileResult, ControllerError> {
    let source: Option<PersistentVolumeClaim> = ctx.disks().get_pvc_by_key(key).await?;
    let Some(source) = source else {
        return Err(SourceError::VirtualDiskNotReady(format!("PVC {key}")).into());
    };

    if obj.is_stored_on_pvc() {
        return pvc::sync_clone(ctx, obj, &source).await;
    }

    let sup = supplements_in(&*obj, key.namespace.as_deref().unwrap_or_default());
    let origin = ImportOrigin::BlockDevice {
        pvc_name: key.name.clone(),
    };
    dvcr_import::sync_to_dvcr_in(ctx, obj, &sup, &origin).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_cvi, create_test_pvc, create_test_vi, test_context};
    use crds::cdi::DataVolume;
    use crds::ImageStorage;
    use k8s_openapi::api::core::v1::Pod;

    #[tokio::test]
    async fn test_missing_pvc_is_not_ready() {
        let (ctx, _, _) = test_context();
        let mut cvi = create_test_cvi("copy");

        let err = sync(&ctx, &mut cvi, &ObjectKey::namespaced("default", "gone")).await.unwrap_err();
        assert!(matches!(err, ControllerError::Source(SourceError::VirtualDiskNotReady(_))));
    }

    #[tokio::test]
    async fn test_cluster_image_importer_runs_next_to_the_pvc() {
        let (ctx, backend, _) = test_context();
        backend.seed(&create_test_pvc("root-pvc", "default"));
        let mut cvi = create_test_cvi("copy");

        sync(&ctx, &mut cvi, &ObjectKey::namespaced("default", "root-pvc")).await.unwrap();

        let sup = supplements_in(&cvi, "default");
        let pod: Option<Pod> = ctx.store.get_by_key(&sup.importer_pod()).await.unwrap();
        assert!(pod.is_some());
    }

    #[tokio::test]
    async fn test_pvc_image_clones() {
        let (ctx, backend, _) = test_context();
        backend.seed(&create_test_pvc("root-pvc", "default"));
        let mut vi = create_test_vi("copy", "default");
        vi.spec.storage = ImageStorage::PersistentVolumeClaim;

        sync(&ctx, &mut vi, &ObjectKey::namespaced("default", "root-pvc")).await.unwrap();

        let sup = vi.supplements(&ctx.settings.controller_namespace);
        let dv: DataVolume = ctx.store.get_by_key(&sup.data_volume()).await.unwrap().unwrap();
        let source = dv.spec.source.pvc.unwrap();
        assert_eq!(source.name, "root-pvc");
        assert_eq!(backend.count("Pod"), 0);
    }
}
