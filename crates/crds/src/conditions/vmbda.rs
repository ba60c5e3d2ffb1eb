//! VirtualMachineBlockDeviceAttachment conditions.

string_enum! {
    /// Condition types.
    pub enum ConditionType {
        /// Block device is ready to be attached
        BlockDeviceReady => "BlockDeviceReady",
        /// Target VM is ready for hotplug
        VirtualMachineReady => "VirtualMachineReady",
        /// Block device is attached
        Attached => "Attached",
    }
}

string_enum! {
    /// Condition reasons.
    pub enum Reason {
        /// Block device is ready
        BlockDeviceReady => "BlockDeviceReady",
        /// Block device is not ready
        BlockDeviceNotReady => "BlockDeviceNotReady",
        /// VM is ready
        VirtualMachineReady => "VirtualMachineReady",
        /// VM is not ready
        VirtualMachineNotReady => "VirtualMachineNotReady",
        /// Device is attached
        Attached => "Attached",
        /// Device is not attached
        NotAttached => "NotAttached",
        /// Hotplug request is sent
        AttachmentRequestSent => "AttachmentRequestSent",
        /// Another attachment targets the same device
        Conflict => "Conflict",
    }
}
