//! VirtualMachineIPAddressClaim and VirtualMachineIPAddressLease CRDs
//!
//! A claim is the namespaced request for an address; a lease is the
//! cluster-wide record that the address is taken.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::Condition;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    derive = "PartialEq",
    group = "virtualization.deckhouse.io",
    version = "v1alpha2",
    kind = "VirtualMachineIPAddressClaim",
    namespaced,
    shortname = "vmip",
    status = "VirtualMachineIPAddressClaimStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineIPAddressClaimSpec {
    /// Lease bound to the claim
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub virtual_machine_ip_address_lease_name: String,

    /// Requested address; allocated automatically when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,

    /// What happens to the lease when the claim is deleted
    #[serde(default)]
    pub reclaim_policy: ReclaimPolicy,
}

/// Lease reclaim policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ReclaimPolicy {
    /// Delete the lease with the claim
    #[default]
    Delete,
    /// Keep the lease for a new claim
    Retain,
}

/// Claim phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ClaimPhase {
    /// Waiting for the lease
    #[default]
    Pending,
    /// Bound to a lease
    Bound,
    /// Lease is gone
    Lost,
    /// Lease belongs to another claim
    Conflict,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineIPAddressClaimStatus {
    /// Current phase
    #[serde(default)]
    pub phase: ClaimPhase,

    /// Bound address
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,

    /// VM using the address
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub virtual_machine_name: String,

    /// Lease bound to the claim
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lease: String,

    /// Reason of a conflict
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub conflict_message: String,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    derive = "PartialEq",
    group = "virtualization.deckhouse.io",
    version = "v1alpha2",
    kind = "VirtualMachineIPAddressLease",
    shortname = "vmipl",
    status = "VirtualMachineIPAddressLeaseStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineIPAddressLeaseSpec {
    /// Claim holding the lease
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_ref: Option<ClaimRef>,

    /// What happens to the lease when the claim is deleted
    #[serde(default)]
    pub reclaim_policy: ReclaimPolicy,
}

/// Reference to a claim.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRef {
    /// Claim namespace
    pub namespace: String,
    /// Claim name
    pub name: String,
}

/// Lease phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub enum LeasePhase {
    /// Bound to a claim
    Bound,
    /// Free for a new claim
    Released,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VirtualMachineIPAddressLeaseStatus {
    /// Current phase; empty until the lease reconciler runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<LeasePhase>,

    /// Conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Returns the lease name for an IPv4 address, e.g. `ip-10-0-0-1`.
#[must_use]
pub fn lease_name_from_ip(address: &str) -> String {
    format!("ip-{}", address.replace('.', "-"))
}

/// Returns the IPv4 address encoded in a lease name.
#[must_use]
pub fn ip_from_lease_name(name: &str) -> Option<String> {
    name.strip_prefix("ip-").map(|rest| rest.replace('-', "."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_name_round_trip() {
        let name = lease_name_from_ip("10.66.10.4");
        assert_eq!(name, "ip-10-66-10-4");
        assert_eq!(ip_from_lease_name(&name).as_deref(), Some("10.66.10.4"));
    }

    #[test]
    fn test_ip_from_foreign_name() {
        assert!(ip_from_lease_name("lease-10-0-0-1").is_none());
    }
}
