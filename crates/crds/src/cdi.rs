//! CDI DataVolume
//!
//! Fills a PVC from a registry image or another PVC. Only the fields the
//! controller uses are modelled.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    derive = "PartialEq",
    group = "cdi.kubevirt.io",
    version = "v1beta1",
    kind = "DataVolume",
    namespaced,
    status = "DataVolumeStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSpec {
    /// Data source
    pub source: DataVolumeSource,

    /// Target PVC settings
    pub pvc: DataVolumePvcSpec,
}

/// Data source of a DataVolume.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSource {
    /// Registry source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<DataVolumeSourceRegistry>,

    /// PVC clone source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<DataVolumeSourcePvc>,
}

/// Registry source.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSourceRegistry {
    /// Image URL, `docker://` prefixed
    pub url: String,

    /// Secret with registry credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,

    /// ConfigMap with the registry CA
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_config_map: Option<String>,
}

/// PVC clone source.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeSourcePvc {
    /// Source namespace
    pub namespace: String,
    /// Source PVC name
    pub name: String,
}

/// Target PVC settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumePvcSpec {
    /// Access modes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,

    /// Resource requests, e.g. `storage: 10Gi`
    #[serde(default)]
    pub resources: DataVolumeResources,

    /// Storage class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Volume mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<String>,
}

/// PVC resource requests.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeResources {
    /// Requests
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DataVolumeStatus {
    /// Phase: Pending, ImportScheduled, ImportInProgress, Succeeded, Failed and so on
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,

    /// Progress, e.g. `45.00%`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub progress: String,

    /// Bound PVC
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub claim_name: String,
}

impl DataVolume {
    /// Returns true when the DataVolume finished successfully.
    #[must_use]
    pub fn is_succeeded(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.phase == "Succeeded")
    }

    /// Returns true when the DataVolume failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.phase == "Failed")
    }
}
