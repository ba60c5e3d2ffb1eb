//! IP address claim and lease reconcilers
//!
//! A claim gets a lease: an address is allocated from the VM CIDRs and a
//! cluster-wide lease named after it records the owner. The lease reconciler
//! releases leases whose claim is gone.

mod claim;
mod lease;

use crds::{ClaimRef, VirtualMachineIPAddressClaim, VirtualMachineIPAddressLease};

pub use claim::ClaimReconciler;
pub use lease::LeaseReconciler;

/// Reference to the claim stored in its lease.
fn claim_ref(claim: &VirtualMachineIPAddressClaim) -> ClaimRef {
    ClaimRef {
        namespace: claim.metadata.namespace.clone().unwrap_or_default(),
        name: claim.metadata.name.clone().unwrap_or_default(),
    }
}

/// Returns true when the lease points at the claim.
fn is_bound_to(lease: &VirtualMachineIPAddressLease, claim: &VirtualMachineIPAddressClaim) -> bool {
    lease.spec.claim_ref.as_ref() == Some(&claim_ref(claim))
}
