//! Field comparators, run in a fixed order.

use serde::Serialize;
use serde_json::{json, Value};

use crds::{CpuSpec, Provisioning, ProvisioningSecretRef, ProvisioningType, VirtualMachineSpec};

use super::{ActionType, ChangeOperation, FieldChange, SpecChanges, BLOCK_DEVICES_PATH};

const DEFAULT_CPU_CORE_FRACTION: &str = "100%";
const DEFAULT_RESTART_APPROVAL_MODE: &str = "Manual";
const DEFAULT_OS_TYPE: &str = "Generic";
const DEFAULT_BOOTLOADER: &str = "BIOS";
const DEFAULT_TERMINATION_GRACE_PERIOD_SECONDS: i64 = 60;

type Comparator = fn(&VirtualMachineSpec, &VirtualMachineSpec) -> Vec<FieldChange>;

const COMPARATORS: &[Comparator] = &[
    compare_virtual_machine_class,
    compare_run_policy,
    compare_virtual_machine_ip_address,
    compare_topology_spread_constraints,
    compare_affinity,
    compare_node_selector,
    compare_priority_class_name,
    compare_tolerations,
    compare_disruptions,
    compare_termination_grace_period_seconds,
    compare_enable_paravirtualization,
    compare_os_type,
    compare_bootloader,
    compare_cpu,
    compare_memory,
    compare_block_devices,
    compare_provisioning,
];

/// Compares the applied spec with the desired one.
pub fn compare_specs(current: &VirtualMachineSpec, desired: &VirtualMachineSpec) -> SpecChanges {
    let mut changes = SpecChanges::default();
    for comparator in COMPARATORS {
        changes.add(comparator(current, desired));
    }
    changes
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn change(
    operation: ChangeOperation,
    path: &str,
    current: Option<Value>,
    desired: Option<Value>,
    action: ActionType,
) -> FieldChange {
    FieldChange {
        operation,
        path: path.to_string(),
        current_value: current,
        desired_value: desired,
        action_required: action,
    }
}

/// Compares optional values; moving between empty and the default needs no action.
fn compare_with_default(
    path: &str,
    current: Option<Value>,
    desired: Option<Value>,
    default: Option<Value>,
    action: ActionType,
) -> Vec<FieldChange> {
    if current == desired {
        return Vec::new();
    }
    let is_default = |v: &Option<Value>| v.is_some() && *v == default;

    let single = match (current, desired) {
        (None, desired) if is_default(&desired) => change(ChangeOperation::Add, path, None, desired, ActionType::None),
        (current, None) if is_default(&current) => change(ChangeOperation::Remove, path, current, None, ActionType::None),
        (None, desired) => change(ChangeOperation::Add, path, None, desired, action),
        (current, None) => change(ChangeOperation::Remove, path, current, None, action),
        (current, desired) => change(ChangeOperation::Replace, path, current, desired, action),
    };
    vec![single]
}

fn non_empty_str(s: &str) -> Option<Value> {
    (!s.is_empty()).then(|| json!(s))
}

fn compare_strings(path: &str, current: &str, desired: &str, default: &str, action: ActionType) -> Vec<FieldChange> {
    compare_with_default(
        path,
        non_empty_str(current),
        non_empty_str(desired),
        non_empty_str(default),
        action,
    )
}

fn compare_ints(path: &str, current: i32, desired: i32, action: ActionType) -> Vec<FieldChange> {
    if current == desired {
        return Vec::new();
    }
    vec![change(
        ChangeOperation::Replace,
        path,
        Some(json!(current)),
        Some(json!(desired)),
        action,
    )]
}

fn compare_bools(path: &str, current: bool, desired: bool, action: ActionType) -> Vec<FieldChange> {
    if current == desired {
        return Vec::new();
    }
    vec![change(
        ChangeOperation::Replace,
        path,
        Some(json!(current)),
        Some(json!(desired)),
        action,
    )]
}

/// Add or remove of a whole section; both present yields nothing so the
/// caller can look inside.
fn compare_empty(path: &str, current: Option<Value>, desired: Option<Value>, action: ActionType) -> Vec<FieldChange> {
    match (current, desired) {
        (None, Some(desired)) => vec![change(ChangeOperation::Add, path, None, Some(desired), action)],
        (Some(current), None) => vec![change(ChangeOperation::Remove, path, Some(current), None, action)],
        _ => Vec::new(),
    }
}

/// Compares free-form values where an empty list or map counts as absent.
fn compare_structured(path: &str, current: Value, desired: Value, action: ActionType) -> Vec<FieldChange> {
    let present = |v: Value| {
        let empty = match &v {
            Value::Null => true,
            Value::Array(a) => a.is_empty(),
            Value::Object(o) => o.is_empty(),
            _ => false,
        };
        (!empty).then_some(v)
    };
    compare_with_default(path, present(current), present(desired), None, action)
}

fn compare_virtual_machine_class(current: &VirtualMachineSpec, desired: &VirtualMachineSpec) -> Vec<FieldChange> {
    compare_strings(
        "virtualMachineClassName",
        &current.virtual_machine_class_name,
        &desired.virtual_machine_class_name,
        "",
        ActionType::Restart,
    )
}

fn compare_run_policy(current: &VirtualMachineSpec, desired: &VirtualMachineSpec) -> Vec<FieldChange> {
    compare_strings(
        "runPolicy",
        current.run_policy.as_str(),
        desired.run_policy.as_str(),
        "",
        ActionType::ApplyImmediate,
    )
}

fn compare_virtual_machine_ip_address(current: &VirtualMachineSpec, desired: &VirtualMachineSpec) -> Vec<FieldChange> {
    compare_strings(
        "virtualMachineIPAddressName",
        &current.virtual_machine_ip_address,
        &desired.virtual_machine_ip_address,
        "",
        ActionType::Restart,
    )
}

fn compare_topology_spread_constraints(current: &VirtualMachineSpec, desired: &VirtualMachineSpec) -> Vec<FieldChange> {
    compare_structured(
        "topologySpreadConstraints",
        to_value(&current.topology_spread_constraints),
        to_value(&desired.topology_spread_constraints),
        ActionType::Restart,
    )
}

fn compare_affinity(current: &VirtualMachineSpec, desired: &VirtualMachineSpec) -> Vec<FieldChange> {
    compare_structured(
        "affinity",
        to_value(&current.affinity),
        to_value(&desired.affinity),
        ActionType::Restart,
    )
}

fn compare_node_selector(current: &VirtualMachineSpec, desired: &VirtualMachineSpec) -> Vec<FieldChange> {
    compare_structured(
        "nodeSelector",
        to_value(&current.node_selector),
        to_value(&desired.node_selector),
        ActionType::Restart,
    )
}

fn compare_priority_class_name(current: &VirtualMachineSpec, desired: &VirtualMachineSpec) -> Vec<FieldChange> {
    compare_strings(
        "priorityClassName",
        &current.priority_class_name,
        &desired.priority_class_name,
        "",
        ActionType::Restart,
    )
}

fn compare_tolerations(current: &VirtualMachineSpec, desired: &VirtualMachineSpec) -> Vec<FieldChange> {
    compare_structured(
        "tolerations",
        to_value(&current.tolerations),
        to_value(&desired.tolerations),
        ActionType::Restart,
    )
}

fn compare_disruptions(current: &VirtualMachineSpec, desired: &VirtualMachineSpec) -> Vec<FieldChange> {
    let changes = compare_empty(
        "disruptions",
        current.disruptions.as_ref().map(to_value),
        desired.disruptions.as_ref().map(to_value),
        ActionType::None,
    );
    if !changes.is_empty() {
        return changes;
    }

    let mode = |spec: &VirtualMachineSpec| {
        spec.disruptions
            .as_ref()
            .and_then(|d| d.restart_approval_mode)
            .map(|m| m.as_str())
            .unwrap_or_default()
    };
    compare_strings(
        "disruptions.restartApprovalMode",
        mode(current),
        mode(desired),
        DEFAULT_RESTART_APPROVAL_MODE,
        ActionType::None,
    )
}

fn compare_termination_grace_period_seconds(
    current: &VirtualMachineSpec,
    desired: &VirtualMachineSpec,
) -> Vec<FieldChange> {
    compare_with_default(
        "terminationGracePeriodSeconds",
        current.termination_grace_period_seconds.map(|v| json!(v)),
        desired.termination_grace_period_seconds.map(|v| json!(v)),
        Some(json!(DEFAULT_TERMINATION_GRACE_PERIOD_SECONDS)),
        ActionType::Restart,
    )
}

fn compare_enable_paravirtualization(current: &VirtualMachineSpec, desired: &VirtualMachineSpec) -> Vec<FieldChange> {
    compare_bools(
        "enableParavirtualization",
        current.enable_paravirtualization,
        desired.enable_paravirtualization,
        ActionType::Restart,
    )
}

fn compare_os_type(current: &VirtualMachineSpec, desired: &VirtualMachineSpec) -> Vec<FieldChange> {
    compare_strings(
        "osType",
        &current.os_type,
        &desired.os_type,
        DEFAULT_OS_TYPE,
        ActionType::Restart,
    )
}

fn compare_bootloader(current: &VirtualMachineSpec, desired: &VirtualMachineSpec) -> Vec<FieldChange> {
    compare_strings(
        "bootloader",
        &current.bootloader,
        &desired.bootloader,
        DEFAULT_BOOTLOADER,
        ActionType::Restart,
    )
}

fn compare_cpu(current: &VirtualMachineSpec, desired: &VirtualMachineSpec) -> Vec<FieldChange> {
    let cores = compare_ints("cpu.cores", current.cpu.cores, desired.cpu.cores, ActionType::Restart);
    let fraction = compare_strings(
        "cpu.coreFraction",
        &current.cpu.core_fraction,
        &desired.cpu.core_fraction,
        DEFAULT_CPU_CORE_FRACTION,
        ActionType::Restart,
    );

    match (cores.is_empty(), fraction.is_empty()) {
        (false, false) => vec![change(
            ChangeOperation::Replace,
            "cpu",
            Some(to_value::<CpuSpec>(&current.cpu)),
            Some(to_value::<CpuSpec>(&desired.cpu)),
            ActionType::Restart,
        )],
        (false, true) => cores,
        (true, _) => fraction,
    }
}

fn compare_memory(current: &VirtualMachineSpec, desired: &VirtualMachineSpec) -> Vec<FieldChange> {
    compare_strings(
        "memory.size",
        &current.memory.size,
        &desired.memory.size,
        "",
        ActionType::Restart,
    )
}

/// Block devices: adding or removing the whole list needs a restart; element
/// changes are hotpluggable and reported by index after trimming the common
/// head and tail.
fn compare_block_devices(current: &VirtualMachineSpec, desired: &VirtualMachineSpec) -> Vec<FieldChange> {
    let (cur, des) = (&current.block_device_refs, &desired.block_device_refs);
    match (cur.is_empty(), des.is_empty()) {
        (true, true) => return Vec::new(),
        (true, false) => {
            return vec![change(
                ChangeOperation::Add,
                BLOCK_DEVICES_PATH,
                None,
                Some(to_value(des)),
                ActionType::Restart,
            )];
        }
        (false, true) => {
            return vec![change(
                ChangeOperation::Remove,
                BLOCK_DEVICES_PATH,
                Some(to_value(cur)),
                None,
                ActionType::Restart,
            )];
        }
        (false, false) => {}
    }

    let shortest = cur.len().min(des.len());
    let prefix = cur.iter().zip(des.iter()).take_while(|(a, b)| a == b).count();
    let suffix = cur
        .iter()
        .rev()
        .zip(des.iter().rev())
        .take(shortest - prefix)
        .take_while(|(a, b)| a == b)
        .count();

    let (cur_end, des_end) = (cur.len() - suffix, des.len() - suffix);
    (prefix..cur_end.max(des_end))
        .filter_map(|i| {
            let path = format!("{BLOCK_DEVICES_PATH}.{i}");
            let (c, d) = (cur.get(i).filter(|_| i < cur_end), des.get(i).filter(|_| i < des_end));
            match (c, d) {
                (Some(c), Some(d)) if c == d => None,
                (Some(c), Some(d)) => Some(change(
                    ChangeOperation::Replace,
                    &path,
                    Some(to_value(c)),
                    Some(to_value(d)),
                    ActionType::ApplyImmediate,
                )),
                (Some(c), None) => Some(change(
                    ChangeOperation::Remove,
                    &path,
                    Some(to_value(c)),
                    None,
                    ActionType::ApplyImmediate,
                )),
                (None, Some(d)) => Some(change(
                    ChangeOperation::Add,
                    &path,
                    None,
                    Some(to_value(d)),
                    ActionType::ApplyImmediate,
                )),
                (None, None) => None,
            }
        })
        .collect()
}

fn compare_secret_ref(
    path: &str,
    current: Option<&ProvisioningSecretRef>,
    desired: Option<&ProvisioningSecretRef>,
) -> Vec<FieldChange> {
    let changes = compare_empty(path, current.map(to_value), desired.map(to_value), ActionType::Restart);
    if !changes.is_empty() {
        return changes;
    }
    let (Some(current), Some(desired)) = (current, desired) else {
        return Vec::new();
    };

    let changes = compare_strings(
        &format!("{path}.kind"),
        &current.kind,
        &desired.kind,
        "",
        ActionType::Restart,
    );
    if !changes.is_empty() {
        return changes;
    }
    compare_strings(
        &format!("{path}.name"),
        &current.name,
        &desired.name,
        "",
        ActionType::Restart,
    )
}

fn compare_provisioning(current: &VirtualMachineSpec, desired: &VirtualMachineSpec) -> Vec<FieldChange> {
    let changes = compare_empty(
        "provisioning",
        current.provisioning.as_ref().map(to_value::<Provisioning>),
        desired.provisioning.as_ref().map(to_value::<Provisioning>),
        ActionType::Restart,
    );
    if !changes.is_empty() {
        return changes;
    }
    let (Some(current), Some(desired)) = (&current.provisioning, &desired.provisioning) else {
        return Vec::new();
    };

    if current.type_ != desired.type_ {
        return vec![change(
            ChangeOperation::Replace,
            "provisioning",
            Some(to_value(&current.type_)),
            Some(to_value(&desired.type_)),
            ActionType::Restart,
        )];
    }

    match current.type_ {
        ProvisioningType::SysprepRef => compare_secret_ref(
            "provisioning.sysprepRef",
            current.sysprep_ref.as_ref(),
            desired.sysprep_ref.as_ref(),
        ),
        ProvisioningType::UserData => compare_strings(
            "provisioning.userData",
            &current.user_data,
            &desired.user_data,
            "",
            ActionType::Restart,
        ),
        ProvisioningType::UserDataRef => compare_secret_ref(
            "provisioning.userDataRef",
            current.user_data_ref.as_ref(),
            desired.user_data_ref.as_ref(),
        ),
    }
}
