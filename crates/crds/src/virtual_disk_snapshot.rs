//! VirtualDiskSnapshot CRD
//!
//! Snapshot of a VirtualDisk backed by a CSI VolumeSnapshot.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    derive = "PartialEq",
    group = "virtualization.deckhouse.io",
    version = "v1alpha2",
    kind = "VirtualDiskSnapshot",
    namespaced,
    shortname = "vdsnapshot",
    status = "VirtualDiskSnapshotStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDiskSnapshotSpec {
    /// Disk to snapshot
    pub virtual_disk_name: String,
}

/// Snapshot phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum VirtualDiskSnapshotPhase {
    /// Nothing started yet
    #[default]
    Pending,
    /// Snapshot is being taken
    InProgress,
    /// Snapshot is usable
    Ready,
    /// Snapshot failed
    Failed,
    /// Snapshot is being deleted
    Terminating,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualDiskSnapshotStatus {
    /// Current phase
    #[serde(default)]
    pub phase: VirtualDiskSnapshotPhase,

    /// Backing VolumeSnapshot
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub volume_snapshot_name: String,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
