//! Services used by sources and handlers.
//!
//! Each service owns the lifecycle of one kind of supplementary object
//! (importer and uploader Pods, DataVolumes and PVCs, hotplug requests, IP
//! address claims) and talks to the cluster only through the object store.

pub mod block_device;
pub mod disk;
pub mod dvcr;
pub mod hotplug;
pub mod importer;
pub mod ipam;
pub mod protection;
pub mod recorder;
pub mod stat;
pub mod supplements;
pub mod uploader;


use thiserror::Error;

use crate::store::StoreError;

/// Errors returned by services.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Object store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Importer report cannot be decoded
    #[error("invalid final report: {0}")]
    InvalidReport(#[from] serde_json::Error),

    /// CA bundle is not valid base64
    #[error("invalid CA bundle: {0}")]
    InvalidCaBundle(#[from] base64::DecodeError),

    /// Object lacks a field the service needs
    #[error("{0}")]
    MissingField(String),

    /// Hotplug cannot proceed
    #[error("{0}")]
    Hotplug(String),
}

impl ServiceError {
    /// Returns true when a namespace quota rejected a supplementary object.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::Store(StoreError::QuotaExceeded(_)))
    }
}
