//! VirtualMachine conditions.

string_enum! {
    /// Condition types.
    pub enum ConditionType {
        /// All block devices are ready
        BlockDevicesReady => "BlockDevicesReady",
        /// IP address claim is bound
        IPAddressReady => "IPAddressReady",
        /// Spec changes wait for a restart approval
        AwaitingRestartToApplyConfiguration => "AwaitingRestartToApplyConfiguration",
        /// Latest spec is applied to the platform object
        ConfigurationApplied => "ConfigurationApplied",
        /// Guest is running
        Running => "Running",
    }
}

string_enum! {
    /// Condition reasons.
    pub enum Reason {
        /// Block devices are ready
        BlockDevicesReady => "BlockDevicesReady",
        /// Some block devices are not ready
        BlockDevicesNotReady => "BlockDevicesNotReady",
        /// Claim is bound
        IPAddressReady => "IPAddressReady",
        /// Claim is not bound yet
        IPAddressNotReady => "IPAddressNotReady",
        /// Claim is bound to another VM
        IPAddressNotAvailable => "IPAddressNotAvailable",
        /// Disruptive changes are pending
        RestartAwaitingChangesExist => "RestartAwaitingChangesExist",
        /// Nothing waits for a restart
        RestartNoNeed => "RestartNoNeed",
        /// Configuration is applied
        ConfigurationApplied => "ConfigurationApplied",
        /// Configuration is not applied
        ConfigurationNotApplied => "ConfigurationNotApplied",
        /// Guest is running
        VmIsRunning => "VmIsRunning",
        /// Guest is not running
        VmIsNotRunning => "VmIsNotRunning",
    }
}
