//! Virtualization CRD Definitions
//!
//! Custom resources reconciled by the virtualization controller, their
//! condition vocabulary, and the minimal projections of the KubeVirt, CDI and
//! CSI snapshot resources the controller creates or reads.

pub mod annotations;
pub mod common;
pub mod conditions;
mod schema;

pub mod cluster_virtual_image;
pub mod virtual_image;
pub mod virtual_disk;
pub mod virtual_disk_snapshot;
pub mod virtual_machine;
pub mod vmbda;
pub mod vmip;

pub mod cdi;
pub mod kubevirt;
pub mod volume_snapshot;

pub use cluster_virtual_image::*;
pub use common::*;
pub use virtual_disk::*;
pub use virtual_disk_snapshot::*;
pub use virtual_image::*;
pub use virtual_machine::*;
pub use vmbda::*;
pub use vmip::*;
