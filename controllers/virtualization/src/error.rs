//! Controller-specific error types.
//!
//! Every layer has its own error enum; they all fold into `ControllerError`,
//! which is what reconcilers return to the scheduler.

use thiserror::Error;
use kube::Error as KubeError;
use dvcr_client::DvcrError;

use crate::service::ServiceError;
use crate::service::ipam::IpamError;
use crate::source::errors::SourceError;
use crate::store::StoreError;

/// Errors that can occur in the virtualization controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Object store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// DVCR error
    #[error("DVCR error: {0}")]
    Dvcr(#[from] DvcrError),

    /// Data source error
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Service error
    #[error(transparent)]
    Service(#[from] ServiceError),

    /// IPAM error
    #[error(transparent)]
    Ipam(#[from] IpamError),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}

impl ControllerError {
    /// Returns true if the error is a store conflict that a fresh reconcile resolves.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(StoreError::Conflict(_)))
    }
}
