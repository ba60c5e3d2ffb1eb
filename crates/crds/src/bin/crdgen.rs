//! Prints the CustomResourceDefinitions of the virtualization API as a
//! multi-document YAML stream.

use crds::{
    ClusterVirtualImage, VirtualDisk, VirtualDiskSnapshot, VirtualImage, VirtualMachine,
    VirtualMachineBlockDeviceAttachment, VirtualMachineIPAddressClaim, VirtualMachineIPAddressLease,
};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [
        ClusterVirtualImage::crd(),
        VirtualImage::crd(),
        VirtualDisk::crd(),
        VirtualDiskSnapshot::crd(),
        VirtualMachine::crd(),
        VirtualMachineBlockDeviceAttachment::crd(),
        VirtualMachineIPAddressClaim::crd(),
        VirtualMachineIPAddressLease::crd(),
    ];

    for crd in &crds {
        print!("---\n{}", serde_yaml::to_string(crd)?);
    }

    Ok(())
}
