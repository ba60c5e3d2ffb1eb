//! KubeVirt VirtualMachine built from a VirtualMachine.
//!
//! The builder starts from the existing KubeVirt VM, if any, so fields the
//! controller does not own survive: the status, hotplugged volumes and the
//! run strategy chosen by the guest.

use std::collections::BTreeMap;

use crds::annotations::{ANN_IP_ADDRESS_CNI_REQUEST, ANN_VM_LAST_APPLIED_SPEC};
use crds::kubevirt::{
    CloudInitNoCloudSource, Disk, Efi, Firmware, KubeVirtVirtualMachine, SecretRef, SysprepSource, Volume,
};
use crds::{ProvisioningType, RunPolicy, VirtualMachine};

use super::ResolvedDevice;
use crate::meta;

/// Volume of the cloud-init data.
pub const CLOUD_INIT_VOLUME: &str = "cloudinit";
/// Volume of the Sysprep data.
pub const SYSPREP_VOLUME: &str = "sysprep";

const BOOTLOADER_EFI: &str = "EFI";
const BOOTLOADER_EFI_SECURE_BOOT: &str = "EFIWithSecureBoot";

/// Run strategy for the run policy; `current` is the strategy already set.
pub fn run_strategy(policy: RunPolicy, current: Option<&str>) -> &str {
    match policy {
        RunPolicy::AlwaysOn => "Always",
        RunPolicy::AlwaysOff => "Halted",
        RunPolicy::Manual => "Manual",
        // Once created, the guest may stop itself and the strategy is kept.
        RunPolicy::AlwaysOnUnlessStoppedManually => current.unwrap_or("Always"),
    }
}

/// CPU request in millicores for `cores` running at `core_fraction`, e.g. `25%`.
pub fn cpu_request(cores: i32, core_fraction: &str) -> String {
    let fraction: i64 = core_fraction
        .trim()
        .trim_end_matches('%')
        .parse()
        .ok()
        .filter(|f| (1..=100).contains(f))
        .unwrap_or(100);
    format!("{}m", i64::from(cores) * 1000 * fraction / 100)
}

fn bus(vm: &VirtualMachine) -> &'static str {
    if vm.spec.enable_paravirtualization {
        "virtio"
    } else {
        "sata"
    }
}

fn firmware(bootloader: &str) -> Option<Firmware> {
    let secure_boot = match bootloader {
        BOOTLOADER_EFI => false,
        BOOTLOADER_EFI_SECURE_BOOT => true,
        _ => return None,
    };
    Some(Firmware {
        efi: Some(Efi { secure_boot }),
    })
}

fn is_hotplugged(volume: &Volume) -> bool {
    volume.persistent_volume_claim.as_ref().is_some_and(|p| p.hotpluggable)
        || volume.container_disk.as_ref().is_some_and(|c| c.hotpluggable)
}

fn provisioning_volume(vm: &VirtualMachine) -> Option<(Volume, bool)> {
    let provisioning = vm.spec.provisioning.as_ref()?;
    let secret = |r: &crds::ProvisioningSecretRef| SecretRef { name: r.name.clone() };
    let (volume, cdrom) = match provisioning.type_ {
        ProvisioningType::UserData => (
            Volume {
                name: CLOUD_INIT_VOLUME.to_string(),
                cloud_init_no_cloud: Some(CloudInitNoCloudSource {
                    user_data: provisioning.user_data.clone(),
                    secret_ref: None,
                }),
                ..Default::default()
            },
            false,
        ),
        ProvisioningType::UserDataRef => (
            Volume {
                name: CLOUD_INIT_VOLUME.to_string(),
                cloud_init_no_cloud: Some(CloudInitNoCloudSource {
                    user_data: String::new(),
                    secret_ref: provisioning.user_data_ref.as_ref().map(secret),
                }),
                ..Default::default()
            },
            false,
        ),
        ProvisioningType::SysprepRef => (
            Volume {
                name: SYSPREP_VOLUME.to_string(),
                sysprep: Some(SysprepSource {
                    secret: provisioning.sysprep_ref.as_ref().map(secret),
                }),
                ..Default::default()
            },
            true,
        ),
    };
    Some((volume, cdrom))
}

/// Builds the KubeVirt VM for `vm` on top of `base`.
///
/// `devices` are the spec block devices in boot order; `ip_address` is the
/// claimed address handed to the CNI.
pub fn build(
    vm: &VirtualMachine,
    base: Option<&KubeVirtVirtualMachine>,
    devices: &[ResolvedDevice],
    ip_address: &str,
) -> Result<KubeVirtVirtualMachine, serde_json::Error> {
    let name = vm.metadata.name.clone().unwrap_or_default();
    let mut kvvm = base
        .cloned()
        .unwrap_or_else(|| KubeVirtVirtualMachine::new(&name, Default::default()));
    kvvm.metadata.namespace = vm.metadata.namespace.clone();
    kvvm.metadata.owner_references = Some(vec![meta::controller_reference(vm)]);
    meta::set_annotation(&mut kvvm, ANN_VM_LAST_APPLIED_SPEC, &serde_json::to_string(&vm.spec)?);

    let current_strategy = base.and_then(|k| k.spec.run_strategy.clone());
    kvvm.spec.run_strategy = Some(run_strategy(vm.spec.run_policy, current_strategy.as_deref()).to_string());

    let template = &mut kvvm.spec.template;
    let annotations = &mut template.metadata.get_or_insert_with(Default::default).annotations;
    if ip_address.is_empty() {
        annotations.remove(ANN_IP_ADDRESS_CNI_REQUEST);
    } else {
        annotations.insert(ANN_IP_ADDRESS_CNI_REQUEST.to_string(), ip_address.to_string());
    }

    let spec = &mut template.spec;
    let domain = &mut spec.domain;
    domain.cpu.cores = u32::try_from(vm.spec.cpu.cores).unwrap_or_default();
    domain.memory.guest = vm.spec.memory.size.clone();
    domain.resources.requests = BTreeMap::from([
        ("cpu".to_string(), cpu_request(vm.spec.cpu.cores, &vm.spec.cpu.core_fraction)),
        ("memory".to_string(), vm.spec.memory.size.clone()),
    ]);
    domain.resources.limits = BTreeMap::from([
        ("cpu".to_string(), vm.spec.cpu.cores.to_string()),
        ("memory".to_string(), vm.spec.memory.size.clone()),
    ]);
    domain.firmware = firmware(&vm.spec.bootloader);

    let hotplugged: Vec<Volume> = spec
        .volumes
        .iter()
        .filter(|v| is_hotplugged(v) && !devices.iter().any(|d| d.volume_name == v.name))
        .cloned()
        .collect();
    let hotplugged_disks: Vec<Disk> = domain
        .devices
        .disks
        .iter()
        .filter(|d| hotplugged.iter().any(|v| v.name == d.name))
        .cloned()
        .collect();

    let bus = bus(vm);
    let mut disks = Vec::new();
    let mut volumes = Vec::new();
    for (order, device) in (1u32..).zip(devices) {
        disks.push(Disk {
            name: device.volume_name.clone(),
            boot_order: Some(order),
            bus: if device.info.cdrom { "sata" } else { bus }.to_string(),
            cdrom: device.info.cdrom,
        });
        volumes.push(device.info.volume(device.volume_name.clone(), false));
    }
    if let Some((volume, cdrom)) = provisioning_volume(vm) {
        disks.push(Disk {
            name: volume.name.clone(),
            boot_order: None,
            bus: if cdrom { "sata" } else { bus }.to_string(),
            cdrom,
        });
        volumes.push(volume);
    }
    disks.extend(hotplugged_disks);
    volumes.extend(hotplugged);
    domain.devices.disks = disks;
    spec.volumes = volumes;

    spec.node_selector = vm.spec.node_selector.clone();
    spec.affinity = vm.spec.affinity.clone();
    spec.tolerations = vm.spec.tolerations.clone();
    spec.topology_spread_constraints = vm.spec.topology_spread_constraints.clone();
    spec.priority_class_name = vm.spec.priority_class_name.clone();
    spec.termination_grace_period_seconds = vm.spec.termination_grace_period_seconds;

    Ok(kvvm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::block_device::DeviceInfo;
    use crate::test_utils::{create_test_kvvm, create_test_vm};
    use crds::kubevirt::PvcVolumeSource;
    use crds::{Provisioning, ProvisioningSecretRef};

    fn disk(volume: &str, pvc: &str) -> ResolvedDevice {
        ResolvedDevice {
            volume_name: volume.to_string(),
            info: DeviceInfo {
                ready: true,
                pvc_name: pvc.to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_cpu_request_from_core_fraction() {
        assert_eq!(cpu_request(2, "25%"), "500m");
        assert_eq!(cpu_request(1, "100%"), "1000m");
        assert_eq!(cpu_request(4, ""), "4000m");
    }

    #[test]
    fn test_run_strategy() {
        assert_eq!(run_strategy(RunPolicy::AlwaysOff, Some("Always")), "Halted");
        assert_eq!(run_strategy(RunPolicy::AlwaysOnUnlessStoppedManually, None), "Always");
        assert_eq!(
            run_strategy(RunPolicy::AlwaysOnUnlessStoppedManually, Some("Halted")),
            "Halted"
        );
    }

    #[test]
    fn test_devices_boot_in_spec_order() {
        let mut vm = create_test_vm("web", "default");
        vm.spec.bootloader = "EFI".to_string();
        vm.spec.provisioning = Some(Provisioning {
            type_: ProvisioningType::UserDataRef,
            user_data: String::new(),
            user_data_ref: Some(ProvisioningSecretRef {
                kind: "Secret".to_string(),
                name: "cloud-config".to_string(),
            }),
            sysprep_ref: None,
        });
        let devices = [disk("vd-root", "pvc-root"), disk("vd-data", "pvc-data")];

        let kvvm = build(&vm, None, &devices, "10.66.10.3").unwrap();

        let spec = &kvvm.spec.template.spec;
        let orders: Vec<_> = spec.domain.devices.disks.iter().map(|d| (d.name.as_str(), d.boot_order)).collect();
        assert_eq!(
            orders,
            vec![("vd-root", Some(1)), ("vd-data", Some(2)), (CLOUD_INIT_VOLUME, None)]
        );
        assert_eq!(spec.volumes[2].cloud_init_no_cloud.as_ref().unwrap().secret_ref.as_ref().unwrap().name, "cloud-config");
        assert!(spec.domain.firmware.as_ref().unwrap().efi.is_some());
        assert_eq!(kvvm.spec.run_strategy.as_deref(), Some("Always"));
        let template_meta = kvvm.spec.template.metadata.as_ref().unwrap();
        assert_eq!(template_meta.annotations[ANN_IP_ADDRESS_CNI_REQUEST], "10.66.10.3");
        let applied = meta::annotation(&kvvm, ANN_VM_LAST_APPLIED_SPEC).unwrap();
        assert_eq!(serde_json::from_str::<crds::VirtualMachineSpec>(applied).unwrap(), vm.spec);
    }

    #[test]
    fn test_hotplugged_volumes_survive_rebuild() {
        let vm = create_test_vm("web", "default");
        let mut base = create_test_kvvm("web", "default");
        base.spec.run_strategy = Some("Halted".to_string());
        base.spec.template.spec.volumes.push(Volume {
            name: "vd-extra".to_string(),
            persistent_volume_claim: Some(PvcVolumeSource {
                claim_name: "pvc-extra".to_string(),
                hotpluggable: true,
            }),
            ..Default::default()
        });
        base.spec.template.spec.domain.devices.disks.push(Disk {
            name: "vd-extra".to_string(),
            boot_order: None,
            bus: "scsi".to_string(),
            cdrom: false,
        });

        let kvvm = build(&vm, Some(&base), &[disk("vd-root", "pvc-root")], "").unwrap();

        let names: Vec<_> = kvvm.spec.template.spec.volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["vd-root", "vd-extra"]);
        assert_eq!(kvvm.spec.template.spec.domain.devices.disks[1].bus, "scsi");
        assert_eq!(kvvm.spec.run_strategy.as_deref(), Some("Halted"));
    }
}
