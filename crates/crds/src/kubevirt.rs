//! KubeVirt VirtualMachine and VirtualMachineInstance
//!
//! Only the fields the controller reads or writes are modelled; the types are
//! never installed by `crdgen`.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::schema::{preserve_unknown_fields, preserve_unknown_fields_list};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    derive = "PartialEq",
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachine",
    root = "KubeVirtVirtualMachine",
    namespaced,
    status = "KubeVirtVirtualMachineStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct KubeVirtVirtualMachineSpec {
    /// Run strategy: Always, Halted, Manual or RerunOnFailure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_strategy: Option<String>,

    /// Instance template
    #[serde(default)]
    pub template: VirtualMachineInstanceTemplate,
}

/// Template for the instance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceTemplate {
    /// Instance labels and annotations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TemplateMetadata>,

    /// Instance spec
    #[serde(default)]
    pub spec: VirtualMachineInstanceSpec,
}

/// Labels and annotations of the instance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct KubeVirtVirtualMachineStatus {
    /// Status shown by kubectl
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub printable_status: String,

    /// Whether the instance is ready
    #[serde(default)]
    pub ready: bool,

    /// Pending hotplug requests
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_requests: Vec<VolumeRequest>,
}

/// Instance spec shared by the VM template and the instance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineInstanceSpec {
    /// Virtual hardware
    #[serde(default)]
    pub domain: DomainSpec,

    /// Volumes backing the disks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    /// Node selector
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Scheduling affinity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub affinity: Option<serde_json::Value>,

    /// Tolerations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "preserve_unknown_fields_list")]
    pub tolerations: Vec<serde_json::Value>,

    /// Topology spread constraints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "preserve_unknown_fields_list")]
    pub topology_spread_constraints: Vec<serde_json::Value>,

    /// Priority class
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub priority_class_name: String,

    /// Grace period for stopping the guest
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_grace_period_seconds: Option<i64>,
}

/// Virtual hardware.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DomainSpec {
    /// CPU topology
    #[serde(default)]
    pub cpu: DomainCpu,

    /// Guest memory
    #[serde(default)]
    pub memory: DomainMemory,

    /// Pod resource requests and limits
    #[serde(default)]
    pub resources: DomainResources,

    /// Firmware settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware: Option<Firmware>,

    /// Devices
    #[serde(default)]
    pub devices: Devices,
}

/// CPU topology.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DomainCpu {
    /// Number of cores
    #[serde(default)]
    pub cores: u32,
}

/// Guest memory.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DomainMemory {
    /// Memory visible to the guest
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub guest: String,
}

/// Pod resource requests and limits.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DomainResources {
    /// Requests
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    /// Limits
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

/// Firmware settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Firmware {
    /// EFI settings; BIOS when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efi: Option<Efi>,
}

/// EFI settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Efi {
    /// Enable secure boot
    #[serde(default)]
    pub secure_boot: bool,
}

/// Devices.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Devices {
    /// Disks
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<Disk>,
}

/// Disk device.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Disk {
    /// Volume name
    pub name: String,

    /// Boot order, starting from 1
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_order: Option<u32>,

    /// Bus of a disk device: virtio, sata or scsi
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bus: String,

    /// Attach as a CD-ROM
    #[serde(default)]
    pub cdrom: bool,
}

/// Volume.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Volume name
    pub name: String,

    /// PVC source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PvcVolumeSource>,

    /// Registry image source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_disk: Option<ContainerDiskSource>,

    /// cloud-init source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_init_no_cloud: Option<CloudInitNoCloudSource>,

    /// Sysprep source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sysprep: Option<SysprepSource>,
}

/// PVC volume source.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PvcVolumeSource {
    /// PVC name
    pub claim_name: String,
    /// Attached by hotplug
    #[serde(default)]
    pub hotpluggable: bool,
}

/// Registry image volume source.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDiskSource {
    /// Image reference
    pub image: String,
    /// Attached by hotplug
    #[serde(default)]
    pub hotpluggable: bool,
}

/// Reference to a Secret holding user data.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Secret name
    pub name: String,
}

/// cloud-init volume source.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CloudInitNoCloudSource {
    /// Inline user data
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_data: String,
    /// User data Secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

/// Sysprep volume source.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SysprepSource {
    /// Sysprep Secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretRef>,
}

/// Hotplug request recorded on the VM.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRequest {
    /// Attach a volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add_volume_options: Option<AddVolumeOptions>,
    /// Detach a volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_volume_options: Option<RemoveVolumeOptions>,
}

/// Attach request.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddVolumeOptions {
    /// Volume name
    pub name: String,
    /// Disk device
    pub disk: Disk,
    /// Volume source
    pub volume_source: HotplugVolumeSource,
}

/// Source of a hotplugged volume.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct HotplugVolumeSource {
    /// PVC source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<PvcVolumeSource>,
    /// Registry image source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_disk: Option<ContainerDiskSource>,
}

/// Detach request.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RemoveVolumeOptions {
    /// Volume name
    pub name: String,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    derive = "PartialEq",
    group = "kubevirt.io",
    version = "v1",
    kind = "VirtualMachineInstance",
    root = "KubeVirtVirtualMachineInstance",
    namespaced,
    status = "KubeVirtVirtualMachineInstanceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct KubeVirtVirtualMachineInstanceSpec {
    /// Instance spec
    #[serde(flatten)]
    pub instance: VirtualMachineInstanceSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct KubeVirtVirtualMachineInstanceStatus {
    /// Phase: Pending, Scheduling, Scheduled, Running, Succeeded, Failed
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,

    /// Node running the instance
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,

    /// Network interfaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<InstanceInterface>,

    /// Guest agent information
    #[serde(default, rename = "guestOSInfo")]
    pub guest_os_info: InstanceGuestOsInfo,

    /// Volume states
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_status: Vec<VolumeStatus>,
}

/// Network interface of an instance.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInterface {
    /// Interface name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Primary address
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip_address: String,
}

/// Guest agent information.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstanceGuestOsInfo {
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

/// State of one volume.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStatus {
    /// Volume name
    pub name: String,
    /// Volume phase; `Ready` once attached
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,
    /// Device name in the guest
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
    /// Present for hotplugged volumes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub hotplug_volume: Option<serde_json::Value>,
}

impl KubeVirtVirtualMachineInstance {
    /// Returns true when the instance is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.phase == "Running")
    }

    /// Returns true when the named volume is attached.
    #[must_use]
    pub fn is_volume_ready(&self, name: &str) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.volume_status.iter().any(|v| v.name == name && v.phase == "Ready"))
    }
}
