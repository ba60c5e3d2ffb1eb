//! Conditions of IP address claims and leases.

string_enum! {
    /// Claim condition types.
    pub enum ClaimConditionType {
        /// Claim is bound to a lease
        Bound => "Bound",
    }
}

string_enum! {
    /// Claim condition reasons.
    pub enum ClaimReason {
        /// Claim is bound
        Bound => "Bound",
        /// Lease does not exist yet
        LeaseNotFound => "VirtualMachineIPAddressLeaseNotFound",
        /// Lease exists but is not bound
        LeaseNotReady => "VirtualMachineIPAddressLeaseNotReady",
        /// Lease referenced by name is gone
        LeaseLost => "VirtualMachineIPAddressLeaseLost",
        /// Lease is bound to another claim
        LeaseAlreadyExists => "VirtualMachineIPAddressLeaseAlreadyExists",
        /// Requested address cannot be leased
        AddressNotAvailable => "VirtualMachineIPAddressIsOutOfTheValidRange",
    }
}

string_enum! {
    /// Lease condition types.
    pub enum LeaseConditionType {
        /// Lease is bound to a claim
        Bound => "Bound",
    }
}

string_enum! {
    /// Lease condition reasons.
    pub enum LeaseReason {
        /// Lease is bound
        Bound => "Bound",
        /// Lease has no claim
        Released => "Released",
    }
}
