//! Types shared by image and disk resources.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;

/// API group of the virtualization resources.
pub const API_GROUP: &str = "virtualization.deckhouse.io";

/// API version of the virtualization resources.
pub const API_VERSION: &str = "v1alpha2";

/// Kind of the data source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
pub enum DataSourceType {
    /// Download from an HTTP(S) URL
    #[default]
    #[serde(rename = "HTTP")]
    Http,

    /// Copy from a container registry
    ContainerImage,

    /// Copy from another virtualization resource
    ObjectRef,

    /// Wait for the user to upload data
    Upload,
}

impl DataSourceType {
    /// Returns the string used in the API.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Http => "HTTP",
            Self::ContainerImage => "ContainerImage",
            Self::ObjectRef => "ObjectRef",
            Self::Upload => "Upload",
        }
    }
}

impl std::fmt::Display for DataSourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checksums to verify downloaded data.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Checksum {
    /// Expected MD5 sum
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,

    /// Expected SHA-256 sum
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// HTTP data source.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceHttp {
    /// URL of the file
    pub url: String,

    /// Expected checksums
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Checksum>,

    /// Base64-encoded CA bundle for the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,
}

/// Reference to an image pull Secret.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImagePullSecretName {
    /// Secret name
    pub name: String,

    /// Secret namespace (cluster-scoped resources only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Container registry data source.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceContainerImage {
    /// Image reference, e.g. `registry.example.com/images/ubuntu:22.04`
    pub image: String,

    /// Pull secret for the registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secret: Option<ImagePullSecretName>,

    /// Base64-encoded CA bundle for the registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,
}

/// Kind of a referenced object.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ObjectRefKind {
    /// Namespaced image
    VirtualImage,
    /// Cluster-wide image
    ClusterVirtualImage,
    /// Disk
    VirtualDisk,
    /// Disk snapshot
    VirtualDiskSnapshot,
}

impl ObjectRefKind {
    /// Returns the kind name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::VirtualImage => "VirtualImage",
            Self::ClusterVirtualImage => "ClusterVirtualImage",
            Self::VirtualDisk => "VirtualDisk",
            Self::VirtualDiskSnapshot => "VirtualDiskSnapshot",
        }
    }
}

/// Reference to another virtualization resource.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceObjectRef {
    /// Referenced kind
    pub kind: ObjectRefKind,

    /// Referenced name
    pub name: String,

    /// Referenced namespace (required when referenced from a cluster-scoped resource)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Where to take the data from.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DataSource {
    /// Data source type
    #[serde(rename = "type")]
    pub type_: DataSourceType,

    /// HTTP settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<DataSourceHttp>,

    /// Container registry settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<DataSourceContainerImage>,

    /// Object reference settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_ref: Option<DataSourceObjectRef>,
}

/// Image phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ImagePhase {
    /// Nothing started yet
    #[default]
    Pending,
    /// Waiting for the user upload
    WaitForUserUpload,
    /// Data is being copied
    Provisioning,
    /// Image is usable
    Ready,
    /// Provisioning failed
    Failed,
    /// Image is not ready
    NotReady,
    /// Image disappeared from the backing storage
    Lost,
    /// PVC of a PVC-stored image is lost
    #[serde(rename = "PVCLost")]
    PvcLost,
    /// Image is being deleted
    Terminating,
}

/// Sizes of a provisioned image.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatusSize {
    /// Human-readable stored size
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stored: String,
    /// Stored size in bytes
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stored_bytes: String,
    /// Human-readable unpacked size
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unpacked: String,
    /// Unpacked size in bytes
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub unpacked_bytes: String,
}

/// Transfer speed of an import.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StatusSpeed {
    /// Human-readable average speed
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub avg: String,
    /// Average speed in bytes per second
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub avg_bytes: String,
    /// Human-readable current speed
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current: String,
    /// Current speed in bytes per second
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_bytes: String,
}

/// Upload endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImageUploadUrls {
    /// URL reachable from outside the cluster
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub external: String,
    /// Command to upload a file
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
}

/// Storage target of an image.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatusTarget {
    /// Image location inside DVCR
    #[serde(default, rename = "registryURL", skip_serializing_if = "String::is_empty")]
    pub registry_url: String,

    /// PVC holding the image
    #[serde(default, rename = "persistentVolumeClaimName", skip_serializing_if = "String::is_empty")]
    pub pvc_name: String,
}

/// Status of ClusterVirtualImage and VirtualImage.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImageStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ImagePhase,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Storage target
    #[serde(default)]
    pub target: ImageStatusTarget,

    /// Image sizes
    #[serde(default)]
    pub size: ImageStatusSize,

    /// Image format
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub format: String,

    /// Whether the image is an ISO
    #[serde(default, rename = "cdrom")]
    pub cdrom: bool,

    /// Import progress
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub progress: String,

    /// Transfer speed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_speed: Option<StatusSpeed>,

    /// Upload endpoints
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_upload_urls: Option<ImageUploadUrls>,

    /// Namespaces whose resources use the image
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub used_in_namespaces: Vec<String>,

    /// Storage class of a PVC-stored image
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub storage_class_name: String,

    /// Generation the status was computed for
    #[serde(default)]
    pub observed_generation: i64,
}
