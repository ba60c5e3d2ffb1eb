//! Container registry data source.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;

use super::errors::SourceError;
use super::{Source, dvcr_import};
use crate::context::Context;
use crate::error::ControllerError;
use crate::provisionable::Provisionable;
use crate::reconciler::ReconcileResult;
use crate::service::importer::ImportOrigin;
use crate::store::ObjectKey;

/// Copies an image from a container registry.
#[derive(Debug, Clone)]
pub struct RegistrySource {
    ctx: Arc<Context>,
}

impl RegistrySource {
    /// Creates the source.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

/// Pull Secret of the data source; namespaced objects may only use their own namespace.
fn pull_secret<K: Provisionable>(obj: &K) -> Option<ObjectKey> {
    let secret = obj.data_source().container_image.as_ref()?.image_pull_secret.as_ref()?;
    if secret.name.is_empty() {
        return None;
    }
    let namespace = obj
        .meta()
        .namespace
        .clone()
        .or_else(|| secret.namespace.clone())
        .unwrap_or_default();
    Some(ObjectKey::namespaced(namespace, secret.name.clone()))
}

fn origin<K: Provisionable>(obj: &K) -> Result<ImportOrigin, SourceError> {
    let image = obj
        .data_source()
        .container_image
        .as_ref()
        .filter(|c| !c.image.is_empty())
        .ok_or_else(|| SourceError::InvalidDataSource("containerImage.image is required".to_string()))?;
    Ok(ImportOrigin::Registry {
        image: image.image.clone(),
        pull_secret: pull_secret(obj),
        ca_bundle: image.ca_bundle.clone(),
    })
}

#[async_trait]
impl<K: Provisionable> Source<K> for RegistrySource {
    async fn sync(&self, obj: &mut K) -> Result<ReconcileResult, ControllerError> {
        let origin = origin(&*obj)?;
        dvcr_import::sync(&self.ctx, obj, &origin).await
    }

    async fn clean_up(&self, obj: &K) -> Result<bool, ControllerError> {
        dvcr_import::clean_up(&self.ctx, obj).await
    }

    async fn validate(&self, obj: &K) -> Result<(), ControllerError> {
        origin(obj)?;
        if let Some(key) = pull_secret(obj) {
            let secret: Option<Secret> = self.ctx.store.get_by_key(&key).await?;
            if secret.is_none() {
                return Err(SourceError::SecretNotFound(key.to_string()).into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_secret, create_test_vi, test_context};
    use crds::{DataSource, DataSourceContainerImage, DataSourceType, ImagePullSecretName};

    fn registry_vi() -> crds::VirtualImage {
        let mut vi = create_test_vi("ubuntu", "default");
        vi.spec.data_source = DataSource {
            type_: DataSourceType::ContainerImage,
            container_image: Some(DataSourceContainerImage {
                image: "registry.example.com/ubuntu:22.04".to_string(),
                image_pull_secret: Some(ImagePullSecretName {
                    name: "creds".to_string(),
                    namespace: Some("other".to_string()),
                }),
                ca_bundle: None,
            }),
            ..Default::default()
        };
        vi
    }

    #[tokio::test]
    async fn test_validate_reports_missing_secret() {
        let (ctx, backend, _) = test_context();
        let source = RegistrySource::new(ctx);
        let vi = registry_vi();

        let err = Source::validate(&source, &vi).await.unwrap_err();
        assert!(matches!(err, ControllerError::Source(SourceError::SecretNotFound(ref s)) if s == "default/creds"));

        backend.seed(&create_test_secret("creds", "default"));
        assert!(Source::validate(&source, &vi).await.is_ok());
    }

    #[test]
    fn test_namespaced_image_ignores_secret_namespace() {
        assert_eq!(pull_secret(&registry_vi()), Some(ObjectKey::namespaced("default", "creds")));
    }
}
