//! Test utilities for unit testing reconcilers
//!
//! Builders for test objects and a context wired to the in-memory store.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateTerminated, ContainerStatus, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimStatus, Pod, PodStatus, Secret, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use crds::kubevirt::{
    KubeVirtVirtualMachine, KubeVirtVirtualMachineInstance, KubeVirtVirtualMachineInstanceSpec,
    KubeVirtVirtualMachineInstanceStatus, KubeVirtVirtualMachineSpec,
};
use crds::*;
use dvcr_client::{DvcrSettings, MockImageChecker};

use crate::context::{Context, ControllerSettings};
use crate::index::BlockDeviceIndex;
use crate::service::recorder::CapturingRecorder;
use crate::service::uploader::UploaderIngressSettings;
use crate::store::Store;
use crate::store::memory::MemoryStore;

/// Namespace of the controller in tests.
pub const CONTROLLER_NAMESPACE: &str = "d8-virtualization";

fn meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        uid: Some(format!("uid-{name}")),
        generation: Some(1),
        ..Default::default()
    }
}

fn http_source() -> DataSource {
    DataSource {
        type_: DataSourceType::Http,
        http: Some(DataSourceHttp {
            url: "https://example.com/a.iso".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Helper to create a test ClusterVirtualImage importing over HTTP
pub fn create_test_cvi(name: &str) -> ClusterVirtualImage {
    ClusterVirtualImage {
        metadata: meta(name, None),
        spec: ClusterVirtualImageSpec {
            data_source: http_source(),
        },
        status: None,
    }
}

/// Helper to create a test VirtualImage stored in DVCR
pub fn create_test_vi(name: &str, namespace: &str) -> VirtualImage {
    VirtualImage {
        metadata: meta(name, Some(namespace)),
        spec: VirtualImageSpec {
            storage: ImageStorage::ContainerRegistry,
            persistent_volume_claim: None,
            data_source: http_source(),
        },
        status: None,
    }
}

/// Helper to create a test VirtualDisk of 10Gi
pub fn create_test_vd(name: &str, namespace: &str) -> VirtualDisk {
    VirtualDisk {
        metadata: meta(name, Some(namespace)),
        spec: VirtualDiskSpec {
            data_source: http_source(),
            persistent_volume_claim: DiskPersistentVolumeClaim {
                size: Some("10Gi".to_string()),
                storage_class_name: None,
            },
        },
        status: None,
    }
}

/// Helper to create a test VirtualMachine without block devices
pub fn create_test_vm(name: &str, namespace: &str) -> VirtualMachine {
    VirtualMachine {
        metadata: meta(name, Some(namespace)),
        spec: VirtualMachineSpec {
            cpu: CpuSpec {
                cores: 1,
                core_fraction: "100%".to_string(),
            },
            memory: MemorySpec {
                size: "1Gi".to_string(),
            },
            ..Default::default()
        },
        status: None,
    }
}

/// Helper to create a test KubeVirt VirtualMachine
pub fn create_test_kvvm(name: &str, namespace: &str) -> KubeVirtVirtualMachine {
    let mut kvvm = KubeVirtVirtualMachine::new(name, KubeVirtVirtualMachineSpec::default());
    kvvm.metadata.namespace = Some(namespace.to_string());
    kvvm
}

/// Helper to create a test KubeVirt VirtualMachineInstance in the given phase
pub fn create_test_kvvmi(name: &str, namespace: &str, phase: &str) -> KubeVirtVirtualMachineInstance {
    let mut kvvmi = KubeVirtVirtualMachineInstance::new(name, KubeVirtVirtualMachineInstanceSpec::default());
    kvvmi.metadata.namespace = Some(namespace.to_string());
    kvvmi.status = Some(KubeVirtVirtualMachineInstanceStatus {
        phase: phase.to_string(),
        ..Default::default()
    });
    kvvmi
}

/// Helper to create a test Secret
pub fn create_test_secret(name: &str, namespace: &str) -> Secret {
    Secret {
        metadata: meta(name, Some(namespace)),
        ..Default::default()
    }
}

/// Helper to create a test lease for an address, without a claim
pub fn create_test_lease(ip: &str) -> VirtualMachineIPAddressLease {
    VirtualMachineIPAddressLease {
        metadata: meta(&lease_name_from_ip(ip), None),
        spec: VirtualMachineIPAddressLeaseSpec::default(),
        status: None,
    }
}

/// Helper to create a bound PVC of 10Gi
pub fn create_test_pvc(name: &str, namespace: &str) -> PersistentVolumeClaim {
    let size = BTreeMap::from([("storage".to_string(), Quantity("10Gi".to_string()))]);
    PersistentVolumeClaim {
        metadata: meta(name, Some(namespace)),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(size.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".to_string()),
            capacity: Some(size),
            ..Default::default()
        }),
    }
}

/// Owner reference of a test VirtualDisk
pub fn create_test_pvc_owner() -> OwnerReference {
    crate::meta::controller_reference(&create_test_vd("root", "default"))
}

/// Store over a fresh in-memory backend
pub fn memory_store() -> (Store, MemoryStore) {
    let backend = MemoryStore::new();
    (Store::new(Arc::new(backend.clone())), backend)
}

/// Context over a fresh in-memory backend and the given image checker
pub fn test_context_with(checker: MockImageChecker) -> (Arc<Context>, MemoryStore, Arc<CapturingRecorder>) {
    let (store, backend) = memory_store();
    let recorder = Arc::new(CapturingRecorder::default());
    let settings = ControllerSettings {
        controller_namespace: CONTROLLER_NAMESPACE.to_string(),
        importer_image: "importer:test".to_string(),
        uploader_image: "uploader:test".to_string(),
        ingress: Arc::new(UploaderIngressSettings {
            host: "upload.example.com".to_string(),
            ..Default::default()
        }),
        vm_cidrs: Arc::new(vec!["10.66.10.0/24".parse().unwrap()]),
    };
    let ctx = Context {
        store,
        dvcr: Arc::new(DvcrSettings::new("dvcr.d8-virtualization.svc")),
        settings: Arc::new(settings),
        checker: Arc::new(checker),
        recorder: Arc::clone(&recorder) as _,
        index: BlockDeviceIndex::new(),
    };
    (Arc::new(ctx), backend, recorder)
}

/// Context over a fresh in-memory backend; every image is missing from DVCR
pub fn test_context() -> (Arc<Context>, MemoryStore, Arc<CapturingRecorder>) {
    test_context_with(MockImageChecker::new())
}

/// Sets the deletion timestamp, as the API server does on delete
pub fn mark_deleting<K: kube::Resource>(obj: &mut K) {
    obj.meta_mut().deletion_timestamp = crate::meta::from_utc(chrono::Utc::now());
}

/// Sets the Pod phase
pub fn set_pod_phase(pod: &mut Pod, phase: &str) {
    pod.status.get_or_insert_with(PodStatus::default).phase = Some(phase.to_string());
}

/// Marks the container terminated with the given termination message
pub fn set_termination_message(pod: &mut Pod, container: &str, message: &str) {
    let status = pod.status.get_or_insert_with(PodStatus::default);
    status.container_statuses = Some(vec![ContainerStatus {
        name: container.to_string(),
        state: Some(ContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: 0,
                message: Some(message.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }]);
}
