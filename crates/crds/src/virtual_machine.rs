//! VirtualMachine CRD
//!
//! User-facing virtual machine, projected onto a KubeVirt VirtualMachine.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;
use crate::schema::{preserve_unknown_fields, preserve_unknown_fields_list};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    derive = "PartialEq",
    group = "virtualization.deckhouse.io",
    version = "v1alpha2",
    kind = "VirtualMachine",
    namespaced,
    shortname = "vm",
    status = "VirtualMachineStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineSpec {
    /// How the VM should be started and stopped
    #[serde(default)]
    pub run_policy: RunPolicy,

    /// Name of the IP address claim
    #[serde(default, rename = "virtualMachineIPAddressName", skip_serializing_if = "String::is_empty")]
    pub virtual_machine_ip_address: String,

    /// Pod topology spread constraints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "preserve_unknown_fields_list")]
    pub topology_spread_constraints: Vec<serde_json::Value>,

    /// Scheduling affinity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub affinity: Option<serde_json::Value>,

    /// Node selector
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Priority class of the VM Pod
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub priority_class_name: String,

    /// Tolerations of the VM Pod
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "preserve_unknown_fields_list")]
    pub tolerations: Vec<serde_json::Value>,

    /// Disruption settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disruptions: Option<Disruptions>,

    /// Grace period for stopping the guest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,

    /// Use paravirtualized devices
    #[serde(default = "default_true")]
    pub enable_paravirtualization: bool,

    /// Guest OS type
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub os_type: String,

    /// Firmware
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bootloader: String,

    /// VirtualMachineClass name
    #[serde(default)]
    pub virtual_machine_class_name: String,

    /// CPU settings
    #[serde(default)]
    pub cpu: CpuSpec,

    /// Memory settings
    #[serde(default)]
    pub memory: MemorySpec,

    /// Attached block devices in boot order
    #[serde(default)]
    pub block_device_refs: Vec<BlockDeviceSpecRef>,

    /// Guest provisioning
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning: Option<Provisioning>,
}

fn default_true() -> bool {
    true
}

impl Default for VirtualMachineSpec {
    fn default() -> Self {
        Self {
            run_policy: RunPolicy::default(),
            virtual_machine_ip_address: String::new(),
            topology_spread_constraints: Vec::new(),
            affinity: None,
            node_selector: BTreeMap::new(),
            priority_class_name: String::new(),
            tolerations: Vec::new(),
            disruptions: None,
            termination_grace_period_seconds: None,
            enable_paravirtualization: true,
            os_type: String::new(),
            bootloader: String::new(),
            virtual_machine_class_name: String::new(),
            cpu: CpuSpec::default(),
            memory: MemorySpec::default(),
            block_device_refs: Vec::new(),
            provisioning: None,
        }
    }
}

/// Run policy of a VM.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum RunPolicy {
    /// Keep running, restart after failures
    AlwaysOn,
    /// Keep stopped
    AlwaysOff,
    /// Controlled by the user
    Manual,
    /// Keep running unless the guest stops itself
    #[default]
    AlwaysOnUnlessStoppedManually,
}

impl RunPolicy {
    /// Returns the string used in the API.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AlwaysOn => "AlwaysOn",
            Self::AlwaysOff => "AlwaysOff",
            Self::Manual => "Manual",
            Self::AlwaysOnUnlessStoppedManually => "AlwaysOnUnlessStoppedManually",
        }
    }
}

/// Restart approval mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum RestartApprovalMode {
    /// Restart without approval
    Automatic,
    /// Wait for the user
    Manual,
}

impl RestartApprovalMode {
    /// Returns the string used in the API.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Automatic => "Automatic",
            Self::Manual => "Manual",
        }
    }
}

/// Disruption settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Disruptions {
    /// How restarts are approved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_approval_mode: Option<RestartApprovalMode>,
}

/// CPU settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CpuSpec {
    /// Number of cores
    #[serde(default)]
    pub cores: i32,

    /// Guaranteed share of each core, e.g. `25%`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub core_fraction: String,
}

/// Memory settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MemorySpec {
    /// Memory size, e.g. `2Gi`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub size: String,
}

/// Kind of a block device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BlockDeviceKind {
    /// Namespaced image
    VirtualImage,
    /// Cluster-wide image
    ClusterVirtualImage,
    /// Disk
    VirtualDisk,
}

impl BlockDeviceKind {
    /// Returns the kind name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::VirtualImage => "VirtualImage",
            Self::ClusterVirtualImage => "ClusterVirtualImage",
            Self::VirtualDisk => "VirtualDisk",
        }
    }
}

impl std::fmt::Display for BlockDeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Block device reference in the VM spec.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceSpecRef {
    /// Device kind
    pub kind: BlockDeviceKind,
    /// Device name
    pub name: String,
}

/// Provisioning type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum ProvisioningType {
    /// Inline cloud-init
    UserData,
    /// cloud-init from a Secret
    UserDataRef,
    /// Sysprep from a Secret
    SysprepRef,
}

/// Reference to a provisioning Secret.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningSecretRef {
    /// Referenced kind
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// Secret name
    pub name: String,
}

/// Guest provisioning.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Provisioning {
    /// Provisioning type
    #[serde(rename = "type")]
    pub type_: ProvisioningType,

    /// Inline cloud-init
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_data: String,

    /// cloud-init Secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_ref: Option<ProvisioningSecretRef>,

    /// Sysprep Secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sysprep_ref: Option<ProvisioningSecretRef>,
}

/// VM phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum MachinePhase {
    /// Waiting for dependencies
    #[default]
    Pending,
    /// Waiting for a node
    Scheduling,
    /// Starting the guest
    Starting,
    /// Guest is running
    Running,
    /// Stopping the guest
    Stopping,
    /// Guest is stopped
    Stopped,
    /// Guest is migrating
    Migrating,
    /// Guest is paused
    Pause,
    /// Guest failed
    Failed,
    /// VM is being deleted
    Terminating,
}

/// Block device attached to a VM.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockDeviceStatusRef {
    /// Device kind
    pub kind: BlockDeviceKind,
    /// Device name
    pub name: String,
    /// Human-readable size
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub size: String,
    /// Backing PVC of a disk
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
    /// Whether the device is attached to the guest
    #[serde(default)]
    pub attached: bool,
    /// Whether the device was attached by hotplug
    #[serde(default)]
    pub hotplugged: bool,
    /// Attachment resource that hotplugged the device
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub virtual_machine_block_device_attachment_name: String,
}

/// Guest OS information reported by the guest agent.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct GuestOsInfo {
    /// OS name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Pretty OS name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pretty_name: String,
    /// OS version
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Kernel release
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kernel_release: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineStatus {
    /// Current phase
    #[serde(default)]
    pub phase: MachinePhase,

    /// Node the guest runs on
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,

    /// Bound IP address claim
    #[serde(default, rename = "virtualMachineIPAddressName", skip_serializing_if = "String::is_empty")]
    pub virtual_machine_ip_address: String,

    /// Guest IP address
    #[serde(default, rename = "ipAddress", skip_serializing_if = "String::is_empty")]
    pub ip_address: String,

    /// Block devices and their attachment state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub block_device_refs: Vec<BlockDeviceStatusRef>,

    /// Guest OS information
    #[serde(default, rename = "guestOSInfo")]
    pub guest_os_info: GuestOsInfo,

    /// Identifier of the pending change set
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub change_id: String,

    /// Changes waiting for a restart
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "preserve_unknown_fields_list")]
    pub pending_changes: Vec<serde_json::Value>,

    /// Human-readable state description
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation the status was computed for
    #[serde(default)]
    pub observed_generation: i64,
}

impl VirtualMachine {
    /// Returns the effective restart approval mode.
    #[must_use]
    pub fn restart_approval_mode(&self) -> RestartApprovalMode {
        self.spec
            .disruptions
            .as_ref()
            .and_then(|d| d.restart_approval_mode)
            .unwrap_or(RestartApprovalMode::Manual)
    }
}
