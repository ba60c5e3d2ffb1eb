//! HTTP data source.

use std::sync::Arc;

use async_trait::async_trait;

use super::errors::SourceError;
use super::{Source, dvcr_import};
use crate::context::Context;
use crate::error::ControllerError;
use crate::provisionable::Provisionable;
use crate::reconciler::ReconcileResult;
use crate::service::importer::ImportOrigin;

/// Downloads a file from an HTTP(S) server.
#[derive(Debug, Clone)]
pub struct HttpSource {
    ctx: Arc<Context>,
}

impl HttpSource {
    /// Creates the source.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

fn origin<K: Provisionable>(obj: &K) -> Result<ImportOrigin, SourceError> {
    let http = obj
        .data_source()
        .http
        .as_ref()
        .filter(|h| !h.url.is_empty())
        .ok_or_else(|| SourceError::InvalidDataSource("http.url is required".to_string()))?;
    let checksum = http.checksum.as_ref();
    Ok(ImportOrigin::Http {
        url: http.url.clone(),
        sha256: checksum.and_then(|c| c.sha256.clone()),
        md5: checksum.and_then(|c| c.md5.clone()),
        ca_bundle: http.ca_bundle.clone(),
    })
}

#[async_trait]
impl<K: Provisionable> Source<K> for HttpSource {
    async fn sync(&self, obj: &mut K) -> Result<ReconcileResult, ControllerError> {
        let origin = origin(&*obj)?;
        dvcr_import::sync(&self.ctx, obj, &origin).await
    }

    async fn clean_up(&self, obj: &K) -> Result<bool, ControllerError> {
        dvcr_import::clean_up(&self.ctx, obj).await
    }

    async fn validate(&self, obj: &K) -> Result<(), ControllerError> {
        origin(obj)?;
        Ok(())
    }
}
