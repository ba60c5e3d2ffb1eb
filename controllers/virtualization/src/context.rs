//! Shared reconcile context.
//!
//! Built once in `main` and handed to every reconciler. Settings are
//! immutable; the block-device index is shared and fed by the
//! VirtualMachine reconciler.

use std::sync::Arc;

use ipnet::Ipv4Net;

use dvcr_client::{DvcrSettings, ImageCheckerTrait};

use crate::index::BlockDeviceIndex;
use crate::service::disk::DiskService;
use crate::service::dvcr::DvcrMaintenanceService;
use crate::service::hotplug::HotplugService;
use crate::service::importer::ImporterService;
use crate::service::ipam::IpamService;
use crate::service::recorder::EventRecorder;
use crate::service::uploader::{UploaderIngressSettings, UploaderService};
use crate::store::Store;

/// Controller settings read from the environment.
#[derive(Debug, Clone, Default)]
pub struct ControllerSettings {
    /// Namespace of the controller; supplements of cluster images live here
    pub controller_namespace: String,
    /// Importer Pod image
    pub importer_image: String,
    /// Uploader Pod image
    pub uploader_image: String,
    /// Upload Ingress settings
    pub ingress: Arc<UploaderIngressSettings>,
    /// CIDRs VM addresses are allocated from
    pub vm_cidrs: Arc<Vec<Ipv4Net>>,
}

/// Everything a reconciler needs besides the object.
#[derive(Clone)]
pub struct Context {
    /// Object store
    pub store: Store,
    /// DVCR settings
    pub dvcr: Arc<DvcrSettings>,
    /// Controller settings
    pub settings: Arc<ControllerSettings>,
    /// DVCR image checker
    pub checker: Arc<dyn ImageCheckerTrait>,
    /// Event recorder
    pub recorder: Arc<dyn EventRecorder>,
    /// Block device → VM index
    pub index: BlockDeviceIndex,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("dvcr", &self.dvcr)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Importer service.
    pub fn importer(&self) -> ImporterService {
        ImporterService::new(
            self.store.clone(),
            self.settings.importer_image.clone(),
            Arc::clone(&self.dvcr),
        )
    }

    /// Uploader service.
    pub fn uploader(&self) -> UploaderService {
        UploaderService::new(
            self.store.clone(),
            self.settings.uploader_image.clone(),
            Arc::clone(&self.dvcr),
            Arc::clone(&self.settings.ingress),
        )
    }

    /// DataVolume and PVC service.
    pub fn disks(&self) -> DiskService {
        DiskService::new(self.store.clone(), Arc::clone(&self.dvcr))
    }

    /// Hotplug service.
    pub fn hotplug(&self) -> HotplugService {
        HotplugService::new(self.store.clone())
    }

    /// IPAM service.
    pub fn ipam(&self) -> IpamService {
        IpamService::new(self.store.clone(), Arc::clone(&self.settings.vm_cidrs))
    }

    /// DVCR maintenance service.
    pub fn maintenance(&self) -> DvcrMaintenanceService {
        DvcrMaintenanceService::new(self.store.clone(), self.settings.controller_namespace.clone())
    }
}
