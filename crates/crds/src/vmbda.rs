//! VirtualMachineBlockDeviceAttachment CRD
//!
//! Hotplugs a disk or image into a running VirtualMachine.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;
use crate::virtual_machine::BlockDeviceKind;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    derive = "PartialEq",
    group = "virtualization.deckhouse.io",
    version = "v1alpha2",
    kind = "VirtualMachineBlockDeviceAttachment",
    namespaced,
    shortname = "vmbda",
    status = "VirtualMachineBlockDeviceAttachmentStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineBlockDeviceAttachmentSpec {
    /// Target VM
    pub virtual_machine_name: String,

    /// Device to attach
    pub block_device_ref: VmbdaObjectRef,
}

/// Kind of a hotpluggable device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum VmbdaObjectRefKind {
    /// Disk
    VirtualDisk,
    /// Namespaced image
    VirtualImage,
    /// Cluster-wide image
    ClusterVirtualImage,
}

impl From<VmbdaObjectRefKind> for BlockDeviceKind {
    fn from(kind: VmbdaObjectRefKind) -> Self {
        match kind {
            VmbdaObjectRefKind::VirtualDisk => Self::VirtualDisk,
            VmbdaObjectRefKind::VirtualImage => Self::VirtualImage,
            VmbdaObjectRefKind::ClusterVirtualImage => Self::ClusterVirtualImage,
        }
    }
}

/// Device reference of an attachment.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VmbdaObjectRef {
    /// Device kind
    pub kind: VmbdaObjectRefKind,
    /// Device name
    pub name: String,
}

/// Attachment phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum BlockDeviceAttachmentPhase {
    /// Waiting for the device or the VM
    #[default]
    Pending,
    /// Hotplug is in progress
    InProgress,
    /// Device is attached
    Attached,
    /// Attachment failed
    Failed,
    /// Attachment is being deleted
    Terminating,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineBlockDeviceAttachmentStatus {
    /// Current phase
    #[serde(default)]
    pub phase: BlockDeviceAttachmentPhase,

    /// Machine-readable failure reason
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub failure_reason: String,

    /// Human-readable failure message
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub failure_message: String,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation the status was computed for
    #[serde(default)]
    pub observed_generation: i64,
}
