//! VM spec change engine
//!
//! Compares the spec last applied to the KubeVirt VirtualMachine with the
//! current VirtualMachine spec and classifies every difference by what it
//! takes to apply it: nothing, an immediate apply, or a guest restart.

mod comparators;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crds::VirtualMachineSpec;

pub use comparators::compare_specs;

/// Change ID reported when nothing is pending.
pub const NO_CHANGES: &str = "NoChanges";

/// Path prefix of block device changes.
pub const BLOCK_DEVICES_PATH: &str = "blockDeviceRefs";

/// What it takes to apply a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ActionType {
    /// Nothing to do, e.g. a field moved between empty and its default
    #[default]
    None,
    /// Apply to the running guest
    ApplyImmediate,
    /// Apply through a subresource call
    SubresourceSignal,
    /// Restart the guest
    Restart,
}

/// Operation of a field change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    /// Field appeared
    Add,
    /// Field changed
    Replace,
    /// Field disappeared
    Remove,
}

/// One changed field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldChange {
    /// Operation
    pub operation: ChangeOperation,
    /// Dotted path, e.g. `cpu.cores` or `blockDeviceRefs.2`
    pub path: String,
    /// Value in the applied spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_value: Option<Value>,
    /// Value in the desired spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_value: Option<Value>,
    /// Required action; not published
    #[serde(skip)]
    pub action_required: ActionType,
}

/// Changes between two VM specs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpecChanges {
    changes: Vec<FieldChange>,
}

impl SpecChanges {
    /// Returns true if there are no changes.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// All changes in comparison order.
    pub fn get_all(&self) -> &[FieldChange] {
        &self.changes
    }

    /// Appends changes.
    pub fn add(&mut self, changes: impl IntoIterator<Item = FieldChange>) {
        self.changes.extend(changes);
    }

    /// The most disruptive action among the changes.
    pub fn action_type(&self) -> ActionType {
        [
            ActionType::Restart,
            ActionType::SubresourceSignal,
            ActionType::ApplyImmediate,
        ]
        .into_iter()
        .find(|action| self.changes.iter().any(|c| c.action_required == *action))
        .unwrap_or(ActionType::None)
    }

    /// Returns true if applying the changes needs a restart.
    pub fn is_disruptive(&self) -> bool {
        self.action_type() == ActionType::Restart
    }

    /// Returns true if every change is a block device change.
    pub fn is_block_device_refs_only(&self) -> bool {
        !self.is_empty() && self.changes.iter().all(|c| c.path.starts_with(BLOCK_DEVICES_PATH))
    }

    fn sorted(&self) -> Vec<&FieldChange> {
        let mut sorted: Vec<&FieldChange> = self.changes.iter().collect();
        sorted.sort_by(|a, b| a.path.cmp(&b.path));
        sorted
    }

    /// JSON array of the changes sorted by path.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.sorted())
    }

    /// YAML list of the changes sorted by path.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(&self.sorted())
    }

    /// Stable identifier of the change set.
    pub fn change_id(&self) -> Result<String, serde_json::Error> {
        if self.is_empty() {
            return Ok(NO_CHANGES.to_string());
        }
        let digest = Sha256::digest(self.to_json()?.as_bytes());
        Ok(hex::encode(digest))
    }

    /// Changes as JSON values for `status.pendingChanges`.
    pub fn pending_changes(&self) -> Result<Vec<Value>, serde_json::Error> {
        self.changes.iter().map(serde_json::to_value).collect()
    }
}

/// Parses the spec stored in the last-applied annotation.
pub fn load_last_applied_spec(raw: &str) -> Result<VirtualMachineSpec, serde_json::Error> {
    serde_json::from_str(raw)
}
