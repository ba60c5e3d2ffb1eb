//! Kubernetes Events about reconciled objects.
//!
//! Publishing never fails a reconcile: errors are logged and dropped.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Client;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::warn;

/// Event reasons published by the controller.
pub mod reasons {
    /// Provisioning started
    pub const PROVISIONING: &str = "Provisioning";
    /// Provisioning failed
    pub const PROVISIONING_FAILED: &str = "ProvisioningFailed";
    /// Object is ready
    pub const READY: &str = "Ready";
    /// Image disappeared from DVCR
    pub const IMAGE_LOST: &str = "ImageLost";
    /// Hotplug request sent
    pub const ATTACHMENT_REQUESTED: &str = "AttachmentRequested";
    /// Hotplugged device removed
    pub const DETACHED: &str = "Detached";
    /// Object reached a state the controller does not handle
    pub const UNKNOWN_STATE: &str = "ErrUnknownState";
    /// Spec changes wait for a restart
    pub const RESTART_REQUIRED: &str = "RestartRequired";
    /// Spec changes applied to the KubeVirt VirtualMachine
    pub const VM_CHANGES_APPLIED: &str = "VMChangesApplied";
    /// Last applied spec annotation is missing or broken
    pub const VM_LAST_APPLIED_SPEC_INVALID: &str = "VMLastAppliedSpecInvalid";
    /// IP address claim belongs to another VM
    pub const IP_ADDRESS_NOT_AVAILABLE: &str = "IPAddressNotAvailable";
    /// Device is attached
    pub const ATTACHED: &str = "Attached";
    /// Claim is bound to a lease
    pub const BOUND: &str = "Bound";
}

/// Publishes Events.
#[async_trait]
pub trait EventRecorder: Send + Sync {
    /// Publishes an Event about the referenced object.
    async fn publish(&self, object: &ObjectReference, type_: EventType, reason: &str, note: String);
}

/// Builds a reference to an object for [`EventRecorder::publish`].
pub fn object_ref<K: kube::Resource<DynamicType = ()>>(obj: &K) -> ObjectReference {
    obj.object_ref(&())
}

/// Recorder backed by the events API.
pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl std::fmt::Debug for KubeEventRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventRecorder").finish_non_exhaustive()
    }
}

impl KubeEventRecorder {
    /// Creates a recorder reporting as `controller`.
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn publish(&self, object: &ObjectReference, type_: EventType, reason: &str, note: String) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, object).await {
            warn!(reason, error = %e, "Failed to publish event");
        }
    }
}

/// Recorder that keeps events in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct CapturingRecorder {
    events: std::sync::Mutex<Vec<(String, String)>>,
}

#[cfg(test)]
impl CapturingRecorder {
    /// Reasons and notes published so far.
    pub fn events(&self) -> Vec<(String, String)> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl EventRecorder for CapturingRecorder {
    async fn publish(&self, _object: &ObjectReference, _type_: EventType, reason: &str, note: String) {
        self.events.lock().unwrap().push((reason.to_string(), note));
    }
}
