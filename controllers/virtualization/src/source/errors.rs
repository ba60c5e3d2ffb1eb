//! Data source validation errors.

use thiserror::Error;

use crds::conditions::image::DatasourceReadyReason;

/// Why a data source cannot be used yet. Each variant carries the name of
/// the referenced object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// Registry pull Secret does not exist
    #[error("container registry secret {0} not found")]
    SecretNotFound(String),

    /// Referenced VirtualImage is missing or not ready
    #[error("VirtualImage {0} not found or not ready")]
    ImageNotReady(String),

    /// Referenced ClusterVirtualImage is missing or not ready
    #[error("ClusterVirtualImage {0} not found or not ready")]
    ClusterImageNotReady(String),

    /// Referenced VirtualDisk is missing or not ready
    #[error("VirtualDisk {0} not found or not ready")]
    VirtualDiskNotReady(String),

    /// Referenced VirtualDisk is ready but cannot be read now
    #[error("VirtualDisk {0} is not ready for use: its PVC waits for the first consumer")]
    VirtualDiskNotReadyForUse(String),

    /// Referenced VirtualDisk is attached to a VirtualMachine
    #[error("VirtualDisk {0} is attached to a virtual machine")]
    VirtualDiskAttachedToVirtualMachine(String),

    /// Referenced VirtualDiskSnapshot is missing or not ready
    #[error("VirtualDiskSnapshot {0} not found or not ready")]
    VirtualDiskSnapshotNotReady(String),

    /// Data source is incomplete or not supported for this kind
    #[error("invalid data source: {0}")]
    InvalidDataSource(String),
}

impl SourceError {
    /// Reason reported in the `DatasourceReady` condition.
    pub fn reason(&self) -> DatasourceReadyReason {
        match self {
            Self::SecretNotFound(_) => DatasourceReadyReason::ContainerRegistrySecretNotFound,
            Self::ImageNotReady(_) => DatasourceReadyReason::ImageNotReady,
            Self::ClusterImageNotReady(_) => DatasourceReadyReason::ClusterImageNotReady,
            Self::VirtualDiskNotReady(_) => DatasourceReadyReason::VirtualDiskNotReady,
            Self::VirtualDiskNotReadyForUse(_) => DatasourceReadyReason::VirtualDiskNotReadyForUse,
            Self::VirtualDiskAttachedToVirtualMachine(_) => {
                DatasourceReadyReason::VirtualDiskAttachedToVirtualMachine
            }
            Self::VirtualDiskSnapshotNotReady(_) => DatasourceReadyReason::VirtualDiskSnapshotNotReady,
            Self::InvalidDataSource(_) => DatasourceReadyReason::DatasourceInvalid,
        }
    }
}
