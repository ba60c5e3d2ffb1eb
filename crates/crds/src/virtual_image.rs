//! VirtualImage CRD
//!
//! Namespaced disk image stored in DVCR or in a PVC.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::common::{DataSource, ImageStatus};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    derive = "PartialEq",
    group = "virtualization.deckhouse.io",
    version = "v1alpha2",
    kind = "VirtualImage",
    namespaced,
    shortname = "vi",
    status = "ImageStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualImageSpec {
    /// Backing storage of the image
    #[serde(default)]
    pub storage: ImageStorage,

    /// PVC settings for `PersistentVolumeClaim` storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<ImagePersistentVolumeClaim>,

    /// Where the image data comes from
    pub data_source: DataSource,
}

/// Backing storage of a VirtualImage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ImageStorage {
    /// Image lives in DVCR
    #[default]
    ContainerRegistry,
    /// Image lives in a PVC
    PersistentVolumeClaim,
}

/// PVC settings of a PVC-stored image.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ImagePersistentVolumeClaim {
    /// Storage class for the PVC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

impl VirtualImage {
    /// Returns true when the image is kept in a PVC instead of DVCR.
    #[must_use]
    pub fn is_stored_on_pvc(&self) -> bool {
        self.spec.storage == ImageStorage::PersistentVolumeClaim
    }
}
