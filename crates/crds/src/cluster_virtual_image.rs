//! ClusterVirtualImage CRD
//!
//! Cluster-wide disk image stored in DVCR.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::common::{DataSource, ImageStatus};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    derive = "PartialEq",
    group = "virtualization.deckhouse.io",
    version = "v1alpha2",
    kind = "ClusterVirtualImage",
    shortname = "cvi",
    status = "ImageStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVirtualImageSpec {
    /// Where the image data comes from
    pub data_source: DataSource,
}
