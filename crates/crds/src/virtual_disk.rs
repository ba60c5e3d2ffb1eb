//! VirtualDisk CRD
//!
//! Namespaced disk backed by a PVC, filled from a data source through DVCR.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::common::{DataSource, ImageUploadUrls, StatusSpeed};
use crate::conditions::Condition;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    derive = "PartialEq",
    group = "virtualization.deckhouse.io",
    version = "v1alpha2",
    kind = "VirtualDisk",
    namespaced,
    shortname = "vd",
    status = "VirtualDiskStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDiskSpec {
    /// Where the disk data comes from
    pub data_source: DataSource,

    /// PVC settings
    #[serde(default)]
    pub persistent_volume_claim: DiskPersistentVolumeClaim,
}

/// PVC settings of a disk.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DiskPersistentVolumeClaim {
    /// Requested size, e.g. `10Gi`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,

    /// Storage class for the PVC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

/// Disk phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum DiskPhase {
    /// Nothing started yet
    #[default]
    Pending,
    /// Waiting for the user upload
    WaitForUserUpload,
    /// PVC waits for the first consumer to be scheduled
    WaitForFirstConsumer,
    /// Data is being copied
    Provisioning,
    /// Disk is usable
    Ready,
    /// Provisioning failed
    Failed,
    /// Disk is lost
    Lost,
    /// PVC of the disk is lost
    #[serde(rename = "PVCLost")]
    PvcLost,
    /// Disk is being deleted
    Terminating,
}

/// PVC holding the disk.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DiskStatusTarget {
    /// PVC name
    #[serde(default, rename = "persistentVolumeClaimName", skip_serializing_if = "String::is_empty")]
    pub pvc_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDiskStatus {
    /// Current phase
    #[serde(default)]
    pub phase: DiskPhase,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Backing PVC
    #[serde(default)]
    pub target: DiskStatusTarget,

    /// Provisioned capacity
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub capacity: String,

    /// Import progress
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub progress: String,

    /// Transfer speed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_speed: Option<StatusSpeed>,

    /// Upload endpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_upload_urls: Option<ImageUploadUrls>,

    /// Storage class of the PVC
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_class_name: String,

    /// Generation the status was computed for
    #[serde(default)]
    pub observed_generation: i64,
}
