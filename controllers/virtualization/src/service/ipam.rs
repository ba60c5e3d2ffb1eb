//! IP address management for VirtualMachines.
//!
//! A VM asks for an address through a VirtualMachineIPAddressClaim in its
//! namespace. The claim is backed by a cluster-wide lease named after the
//! address; addresses are allocated from the configured CIDRs.

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use thiserror::Error;
use tracing::info;

use crds::annotations::{ANN_BOUND_VIRTUAL_MACHINE_NAME, LABEL_IMPLICIT_IP_ADDRESS_CLAIM};
use crds::{
    ReclaimPolicy, VirtualMachine, VirtualMachineIPAddressClaim, VirtualMachineIPAddressClaimSpec,
    VirtualMachineIPAddressLease, ip_from_lease_name,
};

use crate::meta;
use crate::store::{ObjectKey, Store, StoreError};

/// Errors returned by IPAM.
#[derive(Debug, Error)]
pub enum IpamError {
    /// Every address in the configured CIDRs is leased
    #[error("no free IP address left in the virtual machine CIDRs")]
    NoFreeAddress,

    /// Requested address is not an IPv4 address
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Requested address lies outside the configured CIDRs
    #[error("IP address {0} is out of the range of the virtual machine CIDRs")]
    OutOfRange(String),

    /// Claim is already bound to another VM
    #[error("IP address claim {claim} is bound to another virtual machine {vm}")]
    ClaimBound {
        /// Claim namespace/name
        claim: String,
        /// VM bound to the claim
        vm: String,
    },

    /// Object store error
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Name of the claim a VM uses.
pub fn claim_name(vm: &VirtualMachine) -> String {
    if vm.spec.virtual_machine_ip_address.is_empty() {
        vm.metadata.name.clone().unwrap_or_default()
    } else {
        vm.spec.virtual_machine_ip_address.clone()
    }
}

/// VM a claim is bound to, if any.
pub fn bound_vm(claim: &VirtualMachineIPAddressClaim) -> Option<&str> {
    meta::annotation(claim, ANN_BOUND_VIRTUAL_MACHINE_NAME).filter(|name| !name.is_empty())
}

/// Returns an error when the claim is bound to a VM other than `vm_name`.
pub fn check_claim_available_for_binding(
    vm_name: &str,
    claim: &VirtualMachineIPAddressClaim,
) -> Result<(), IpamError> {
    match bound_vm(claim) {
        Some(bound) if bound != vm_name => Err(IpamError::ClaimBound {
            claim: ObjectKey::of(claim).to_string(),
            vm: bound.to_string(),
        }),
        _ => Ok(()),
    }
}

/// First address of the CIDRs not in `used`; network and broadcast addresses are skipped.
pub fn first_free_address(cidrs: &[Ipv4Net], used: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
    cidrs.iter().flat_map(Ipv4Net::hosts).find(|ip| !used.contains(ip))
}

/// Claims and allocates VM addresses.
#[derive(Debug, Clone)]
pub struct IpamService {
    store: Store,
    cidrs: Arc<Vec<Ipv4Net>>,
}

impl IpamService {
    /// Creates a service allocating from `cidrs`.
    pub fn new(store: Store, cidrs: Arc<Vec<Ipv4Net>>) -> Self {
        Self { store, cidrs }
    }

    /// Claim used by the VM, if it exists.
    pub async fn get_claim(&self, vm: &VirtualMachine) -> Result<Option<VirtualMachineIPAddressClaim>, IpamError> {
        let namespace = vm.metadata.namespace.as_deref();
        Ok(self.store.get(namespace, &claim_name(vm)).await?)
    }

    /// Creates an implicit claim for the VM, already bound to it.
    pub async fn create_ip_address_claim(&self, vm: &VirtualMachine) -> Result<VirtualMachineIPAddressClaim, IpamError> {
        let vm_name = vm.metadata.name.clone().unwrap_or_default();
        let claim = VirtualMachineIPAddressClaim {
            metadata: ObjectMeta {
                name: Some(claim_name(vm)),
                namespace: vm.metadata.namespace.clone(),
                labels: Some(BTreeMap::from([(LABEL_IMPLICIT_IP_ADDRESS_CLAIM.to_string(), "true".to_string())])),
                annotations: Some(BTreeMap::from([(ANN_BOUND_VIRTUAL_MACHINE_NAME.to_string(), vm_name)])),
                ..Default::default()
            },
            spec: VirtualMachineIPAddressClaimSpec {
                reclaim_policy: ReclaimPolicy::Delete,
                ..Default::default()
            },
            status: None,
        };

        info!("Creating IP address claim {}", ObjectKey::of(&claim));
        Ok(self.store.create(&claim).await?)
    }

    /// Binds the claim to the VM; binding to the same VM again is a no-op.
    pub async fn bind_ip_address_claim(
        &self,
        vm: &VirtualMachine,
        claim: &VirtualMachineIPAddressClaim,
    ) -> Result<(), IpamError> {
        let vm_name = vm.metadata.name.as_deref().unwrap_or_default();
        check_claim_available_for_binding(vm_name, claim)?;
        if bound_vm(claim) == Some(vm_name) {
            return Ok(());
        }

        let mut bound = claim.clone();
        meta::set_annotation(&mut bound, ANN_BOUND_VIRTUAL_MACHINE_NAME, vm_name);
        info!("Binding IP address claim {} to {}", ObjectKey::of(claim), vm_name);
        self.store.update(&bound).await?;
        Ok(())
    }

    /// Addresses held by existing leases.
    pub async fn leased_addresses(&self) -> Result<HashSet<Ipv4Addr>, IpamError> {
        let leases: Vec<VirtualMachineIPAddressLease> = self.store.list(None).await?;
        Ok(leases
            .iter()
            .filter_map(|l| ip_from_lease_name(l.metadata.name.as_deref()?))
            .filter_map(|ip| ip.parse().ok())
            .collect())
    }

    /// Picks the address for a claim: the requested one when set, otherwise the first free one.
    pub async fn allocate(&self, requested: &str) -> Result<Ipv4Addr, IpamError> {
        if !requested.is_empty() {
            let ip: Ipv4Addr = requested
                .parse()
                .map_err(|_| IpamError::InvalidAddress(requested.to_string()))?;
            if !self.cidrs.iter().any(|net| net.contains(&ip)) {
                return Err(IpamError::OutOfRange(requested.to_string()));
            }
            return Ok(ip);
        }

        let used = self.leased_addresses().await?;
        first_free_address(&self.cidrs, &used).ok_or(IpamError::NoFreeAddress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_lease, create_test_vm, memory_store};

    fn cidrs(nets: &[&str]) -> Arc<Vec<Ipv4Net>> {
        Arc::new(nets.iter().map(|n| n.parse().unwrap()).collect())
    }

    #[test]
    fn test_first_free_skips_network_and_broadcast() {
        let nets = cidrs(&["10.0.0.0/30", "10.0.1.0/30"]);
        let mut used = HashSet::new();

        assert_eq!(first_free_address(&nets, &used), Some(Ipv4Addr::new(10, 0, 0, 1)));
        used.insert(Ipv4Addr::new(10, 0, 0, 1));
        used.insert(Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(first_free_address(&nets, &used), Some(Ipv4Addr::new(10, 0, 1, 1)));
        used.insert(Ipv4Addr::new(10, 0, 1, 1));
        used.insert(Ipv4Addr::new(10, 0, 1, 2));
        assert_eq!(first_free_address(&nets, &used), None);
    }

    #[tokio::test]
    async fn test_allocate_skips_leased() {
        let (store, backend) = memory_store();
        backend.seed(&create_test_lease("10.0.0.1"));
        let ipam = IpamService::new(store, cidrs(&["10.0.0.0/29"]));

        assert_eq!(ipam.allocate("").await.unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(ipam.allocate("10.0.0.5").await.unwrap(), Ipv4Addr::new(10, 0, 0, 5));
        assert!(matches!(ipam.allocate("192.168.0.1").await, Err(IpamError::OutOfRange(_))));
        assert!(matches!(ipam.allocate("garbage").await, Err(IpamError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn test_bind_is_idempotent() {
        let (store, _) = memory_store();
        let ipam = IpamService::new(store, cidrs(&["10.0.0.0/24"]));
        let vm = create_test_vm("web", "default");

        let claim = ipam.create_ip_address_claim(&vm).await.unwrap();
        assert_eq!(bound_vm(&claim), Some("web"));
        assert_eq!(meta::label(&claim, LABEL_IMPLICIT_IP_ADDRESS_CLAIM), Some("true"));

        ipam.bind_ip_address_claim(&vm, &claim).await.unwrap();
        ipam.bind_ip_address_claim(&vm, &claim).await.unwrap();
        let stored = ipam.get_claim(&vm).await.unwrap().unwrap();
        assert_eq!(stored.metadata.resource_version, claim.metadata.resource_version);
    }

    #[tokio::test]
    async fn test_bind_to_another_vm_fails() {
        let (store, _) = memory_store();
        let ipam = IpamService::new(store.clone(), cidrs(&["10.0.0.0/24"]));
        let web = create_test_vm("web", "default");
        let mut db = create_test_vm("db", "default");
        db.spec.virtual_machine_ip_address = "web".to_string();

        let claim = ipam.create_ip_address_claim(&web).await.unwrap();
        let result = ipam.bind_ip_address_claim(&db, &claim).await;

        assert!(matches!(result, Err(IpamError::ClaimBound { ref vm, .. }) if vm == "web"));
        assert!(check_claim_available_for_binding("web", &claim).is_ok());
        let stored: VirtualMachineIPAddressClaim = store.get(Some("default"), "web").await.unwrap().unwrap();
        assert_eq!(bound_vm(&stored), Some("web"));
        assert_eq!(stored.metadata.resource_version, claim.metadata.resource_version);
    }

    #[tokio::test]
    async fn test_unbound_claim_gets_bound() {
        let (store, _) = memory_store();
        let ipam = IpamService::new(store.clone(), cidrs(&["10.0.0.0/24"]));
        let vm = create_test_vm("web", "default");
        let mut claim = ipam.create_ip_address_claim(&vm).await.unwrap();
        claim.metadata.annotations = None;
        let claim = store.update(&claim).await.unwrap();

        ipam.bind_ip_address_claim(&vm, &claim).await.unwrap();

        let stored = ipam.get_claim(&vm).await.unwrap().unwrap();
        assert_eq!(bound_vm(&stored), Some("web"));
    }
}
