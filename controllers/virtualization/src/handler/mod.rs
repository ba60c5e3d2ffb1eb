//! Handlers of ClusterVirtualImage, VirtualImage and VirtualDisk
//!
//! Every handler is generic over [`Provisionable`](crate::provisionable::Provisionable),
//! so the three kinds run the same steps with kind-specific constants.

pub mod attachee;
pub mod datasource_ready;
pub mod deletion;
pub mod image_presence;
pub mod inuse;
pub mod life_cycle;
pub mod postpone;

pub use attachee::AttacheeHandler;
pub use datasource_ready::DatasourceReadyHandler;
pub use deletion::DeletionHandler;
pub use image_presence::ImagePresenceHandler;
pub use inuse::InUseHandler;
pub use life_cycle::LifeCycleHandler;
pub use postpone::PostponeHandler;
