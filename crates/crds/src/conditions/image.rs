//! Conditions of ClusterVirtualImage, VirtualImage and VirtualDisk.
//!
//! The three kinds share one condition vocabulary; reasons that only a
//! VirtualDisk reports are marked as such.

string_enum! {
    /// Condition types.
    pub enum ConditionType {
        /// The data source is valid and its dependencies are ready
        DatasourceReady => "DatasourceReady",
        /// The resource is provisioned and usable
        Ready => "Ready",
        /// The resource is used by other resources
        InUse => "InUse",
    }
}

string_enum! {
    /// Reasons of the `DatasourceReady` condition.
    pub enum DatasourceReadyReason {
        /// Data source is ready
        DatasourceReady => "DatasourceReady",
        /// Registry pull secret is missing
        ContainerRegistrySecretNotFound => "ContainerRegistrySecretNotFound",
        /// Referenced VirtualImage is not ready
        ImageNotReady => "ImageNotReady",
        /// Referenced ClusterVirtualImage is not ready
        ClusterImageNotReady => "ClusterImageNotReady",
        /// Referenced VirtualDisk is not ready
        VirtualDiskNotReady => "VirtualDiskNotReady",
        /// Referenced VirtualDisk cannot be read right now
        VirtualDiskNotReadyForUse => "VirtualDiskNotReadyForUse",
        /// Referenced VirtualDisk is attached to a running VirtualMachine
        VirtualDiskAttachedToVirtualMachine => "VirtualDiskAttachedToVirtualMachine",
        /// Referenced VirtualDiskSnapshot is not ready
        VirtualDiskSnapshotNotReady => "VirtualDiskSnapshotNotReady",
        /// Data source cannot be used
        DatasourceInvalid => "DatasourceInvalid",
    }
}

string_enum! {
    /// Reasons of the `Ready` condition.
    pub enum ReadyReason {
        /// Waiting for the user to upload data
        WaitForUserUpload => "WaitForUserUpload",
        /// Provisioning is in progress
        Provisioning => "Provisioning",
        /// Provisioning Pod is not started yet
        ProvisioningNotStarted => "ProvisioningNotStarted",
        /// Provisioning failed
        ProvisioningFailed => "ProvisioningFailed",
        /// Provisioning is postponed while the registry is unavailable
        ProvisioningPostponed => "ProvisioningPostponed",
        /// Resource quota does not allow creating sub-resources
        QuotaExceeded => "QuotaExceeded",
        /// Resource is ready
        Ready => "Ready",
        /// Image disappeared from the registry
        ImageLost => "ImageLost",
        /// VirtualDisk only: PVC waits for the first consumer
        WaitingForFirstConsumer => "WaitingForFirstConsumer",
        /// VirtualDisk only: PVC is lost
        PVCLost => "PVCLost",
    }
}

string_enum! {
    /// Reasons of the `InUse` condition.
    pub enum InUseReason {
        /// Resource is used by others
        InUse => "InUse",
        /// Resource is not used
        NotInUse => "NotInUse",
    }
}
