//! Label and annotation propagation from the VM to the KubeVirt VM.
//!
//! A three-way merge: keys set on the VM win, keys propagated last time but
//! since removed from the VM are removed, keys set by others are left alone.
//! Controller-owned annotations are never propagated.

use std::collections::BTreeMap;

use crds::VirtualMachine;
use crds::annotations::{ANN_API_GROUP, ANN_LAST_PROPAGATED_ANNOTATIONS, ANN_LAST_PROPAGATED_LABELS};
use crds::kubevirt::KubeVirtVirtualMachine;

use crate::meta;

const LAST_APPLIED_CONFIGURATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

fn is_propagated(key: &str) -> bool {
    key.split_once('/').is_none_or(|(prefix, _)| prefix != ANN_API_GROUP) && key != LAST_APPLIED_CONFIGURATION
}

fn propagated(source: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    source
        .into_iter()
        .flatten()
        .filter(|(k, _)| is_propagated(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn last_propagated(kvvm: &KubeVirtVirtualMachine, annotation: &str) -> BTreeMap<String, String> {
    meta::annotation(kvvm, annotation)
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}

/// Applies `desired` over `target`, dropping keys of `last` gone from `desired`.
fn merge(target: &mut BTreeMap<String, String>, last: &BTreeMap<String, String>, desired: &BTreeMap<String, String>) {
    for key in last.keys() {
        if !desired.contains_key(key) {
            target.remove(key);
        }
    }
    for (key, value) in desired {
        target.insert(key.clone(), value.clone());
    }
}

/// Propagates VM labels and annotations to the KubeVirt VM and its template.
///
/// Returns true if the KubeVirt VM changed.
pub fn propagate(vm: &VirtualMachine, kvvm: &mut KubeVirtVirtualMachine) -> Result<bool, serde_json::Error> {
    let before = kvvm.clone();
    let labels = propagated(vm.metadata.labels.as_ref());
    let annotations = propagated(vm.metadata.annotations.as_ref());
    let last_labels = last_propagated(kvvm, ANN_LAST_PROPAGATED_LABELS);
    let last_annotations = last_propagated(kvvm, ANN_LAST_PROPAGATED_ANNOTATIONS);

    merge(
        kvvm.metadata.labels.get_or_insert_with(Default::default),
        &last_labels,
        &labels,
    );
    merge(
        kvvm.metadata.annotations.get_or_insert_with(Default::default),
        &last_annotations,
        &annotations,
    );
    let template = kvvm.spec.template.metadata.get_or_insert_with(Default::default);
    merge(&mut template.labels, &last_labels, &labels);
    merge(&mut template.annotations, &last_annotations, &annotations);

    meta::set_annotation(kvvm, ANN_LAST_PROPAGATED_LABELS, &serde_json::to_string(&labels)?);
    meta::set_annotation(kvvm, ANN_LAST_PROPAGATED_ANNOTATIONS, &serde_json::to_string(&annotations)?);
    Ok(*kvvm != before)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_kvvm, create_test_vm};

    #[test]
    fn test_three_way_merge() {
        let mut vm = create_test_vm("web", "default");
        vm.metadata.labels = Some(BTreeMap::from([
            ("app".to_string(), "web".to_string()),
            ("tier".to_string(), "front".to_string()),
        ]));
        let mut kvvm = create_test_kvvm("web", "default");
        kvvm.metadata.labels = Some(BTreeMap::from([("foreign".to_string(), "x".to_string())]));

        assert!(propagate(&vm, &mut kvvm).unwrap());
        assert!(!propagate(&vm, &mut kvvm).unwrap());

        vm.metadata.labels = Some(BTreeMap::from([("app".to_string(), "web".to_string())]));
        assert!(propagate(&vm, &mut kvvm).unwrap());

        let labels = kvvm.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some("web"));
        assert!(!labels.contains_key("tier"));
        assert_eq!(labels.get("foreign").map(String::as_str), Some("x"));
        let template = kvvm.spec.template.metadata.as_ref().unwrap();
        assert!(!template.labels.contains_key("tier"));
    }

    #[test]
    fn test_controller_annotations_stay_on_vm() {
        let mut vm = create_test_vm("web", "default");
        vm.metadata.annotations = Some(BTreeMap::from([
            ("virt.deckhouse.io/vm.last-applied-spec".to_string(), "{}".to_string()),
            ("team".to_string(), "infra".to_string()),
        ]));
        let mut kvvm = create_test_kvvm("web", "default");

        propagate(&vm, &mut kvvm).unwrap();

        let template = kvvm.spec.template.metadata.as_ref().unwrap();
        assert_eq!(template.annotations.len(), 1);
        assert_eq!(template.annotations["team"], "infra");
    }
}
