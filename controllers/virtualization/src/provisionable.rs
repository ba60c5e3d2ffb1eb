//! Capabilities shared by ClusterVirtualImage, VirtualImage and VirtualDisk.
//!
//! Handlers and sources are generic over [`Provisionable`]; each kind maps
//! the common phase and status fields onto its own status type.

use crds::annotations::{
    ANN_POD_RETAIN_AFTER_COMPLETION, FINALIZER_CVI_CLEANUP, FINALIZER_CVI_PROTECTION, FINALIZER_VD_CLEANUP,
    FINALIZER_VD_PROTECTION, FINALIZER_VI_CLEANUP, FINALIZER_VI_PROTECTION,
};
use crds::conditions::Condition;
use crds::{
    BlockDeviceKind, ClusterVirtualImage, DataSource, DiskPhase, ImagePhase, ImageStatus, ImageStatusSize,
    ImageUploadUrls, ObjectRefKind, StatusSpeed, VirtualDisk, VirtualImage,
};
use dvcr_client::DvcrSettings;

use crate::meta;
use crate::service::supplements::Supplements;
use crate::store::Object;

/// Provisioning phase common to images and disks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting to start
    Pending,
    /// Waiting for the user to upload data
    WaitForUserUpload,
    /// PVC waits for the first consumer
    WaitForFirstConsumer,
    /// Data is being copied
    Provisioning,
    /// Ready to use
    Ready,
    /// Provisioning failed
    Failed,
    /// Data disappeared from DVCR
    Lost,
    /// PVC disappeared
    PvcLost,
    /// Being deleted
    Terminating,
}

/// Result of an import reported by the importer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportResult {
    /// Stored and unpacked sizes
    pub size: ImageStatusSize,
    /// Image format
    pub format: String,
    /// ISO image
    pub cdrom: bool,
}

/// An object filled from a data source.
pub trait Provisionable: Object {
    /// Kind abbreviation used in supplement names
    const SHORT_KIND: &'static str;
    /// Finalizer held until supplements are removed
    const CLEANUP_FINALIZER: &'static str;
    /// Finalizer held while VMs use the object
    const PROTECTION_FINALIZER: &'static str;
    /// Kind as referenced from VM block devices
    const BLOCK_DEVICE_KIND: BlockDeviceKind;
    /// Kind as referenced from another object's data source
    const OBJECT_REF_KIND: ObjectRefKind;

    /// Data source of the object.
    fn data_source(&self) -> &DataSource;

    /// Status conditions.
    fn conditions(&self) -> &[Condition];

    /// Mutable status conditions.
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    /// Current phase.
    fn phase(&self) -> Phase;

    /// Sets the phase.
    fn set_phase(&mut self, phase: Phase);

    /// Progress string, e.g. `45.0%`.
    fn progress(&self) -> &str;

    /// Sets the progress.
    fn set_progress(&mut self, progress: String);

    /// Sets the transfer speed.
    fn set_download_speed(&mut self, speed: Option<StatusSpeed>);

    /// Sets the upload URLs.
    fn set_upload_urls(&mut self, urls: Option<ImageUploadUrls>);

    /// Records size and format reported by the importer.
    fn set_import_result(&mut self, result: ImportResult);

    /// Location in DVCR, empty when not stored there.
    fn target_registry_url(&self) -> &str;

    /// Sets the location in DVCR.
    fn set_target_registry_url(&mut self, url: String);

    /// Sets the PVC holding the data.
    fn set_target_pvc(&mut self, pvc: String);

    /// Sets the PVC capacity.
    fn set_capacity(&mut self, _capacity: String) {}

    /// Sets the storage class used.
    fn set_storage_class_name(&mut self, name: String);

    /// Records the namespaces of the consumers.
    fn set_used_in_namespaces(&mut self, _namespaces: Vec<String>) {}

    /// Generation the status was computed for.
    fn set_observed_generation(&mut self, generation: i64);

    /// Returns true when the data ends up in a PVC.
    fn is_stored_on_pvc(&self) -> bool;

    /// Storage class requested for the PVC.
    fn storage_class(&self) -> Option<&str> {
        None
    }

    /// Size requested for the PVC.
    fn requested_size(&self) -> Option<&str> {
        None
    }

    /// Clears everything but the conditions and sets the phase to Pending.
    fn reset_status(&mut self);

    /// Image location in DVCR.
    fn dvcr_image(&self, dvcr: &DvcrSettings) -> String;

    /// Namespace of the supplements.
    fn supplements_namespace<'a>(&'a self, controller_namespace: &'a str) -> &'a str {
        self.meta().namespace.as_deref().unwrap_or(controller_namespace)
    }

    /// Names of the supplements.
    fn supplements(&self, controller_namespace: &str) -> Supplements {
        Supplements::new(
            Self::SHORT_KIND,
            self.meta().name.as_deref().unwrap_or_default(),
            self.supplements_namespace(controller_namespace),
            meta::uid(self),
        )
    }

    /// Returns false when the user asked to keep Pods after completion.
    fn should_clean_up_supplements(&self) -> bool {
        meta::annotation(self, ANN_POD_RETAIN_AFTER_COMPLETION) != Some("true")
    }
}

fn image_phase(phase: Phase) -> ImagePhase {
    match phase {
        Phase::Pending => ImagePhase::Pending,
        Phase::WaitForUserUpload => ImagePhase::WaitForUserUpload,
        Phase::WaitForFirstConsumer | Phase::Provisioning => ImagePhase::Provisioning,
        Phase::Ready => ImagePhase::Ready,
        Phase::Failed => ImagePhase::Failed,
        Phase::Lost => ImagePhase::Lost,
        Phase::PvcLost => ImagePhase::PvcLost,
        Phase::Terminating => ImagePhase::Terminating,
    }
}

fn from_image_phase(phase: ImagePhase) -> Phase {
    match phase {
        ImagePhase::Pending | ImagePhase::NotReady => Phase::Pending,
        ImagePhase::WaitForUserUpload => Phase::WaitForUserUpload,
        ImagePhase::Provisioning => Phase::Provisioning,
        ImagePhase::Ready => Phase::Ready,
        ImagePhase::Failed => Phase::Failed,
        ImagePhase::Lost => Phase::Lost,
        ImagePhase::PvcLost => Phase::PvcLost,
        ImagePhase::Terminating => Phase::Terminating,
    }
}

fn disk_phase(phase: Phase) -> DiskPhase {
    match phase {
        Phase::Pending => DiskPhase::Pending,
        Phase::WaitForUserUpload => DiskPhase::WaitForUserUpload,
        Phase::WaitForFirstConsumer => DiskPhase::WaitForFirstConsumer,
        Phase::Provisioning => DiskPhase::Provisioning,
        Phase::Ready => DiskPhase::Ready,
        Phase::Failed => DiskPhase::Failed,
        Phase::Lost => DiskPhase::Lost,
        Phase::PvcLost => DiskPhase::PvcLost,
        Phase::Terminating => DiskPhase::Terminating,
    }
}

fn from_disk_phase(phase: DiskPhase) -> Phase {
    match phase {
        DiskPhase::Pending => Phase::Pending,
        DiskPhase::WaitForUserUpload => Phase::WaitForUserUpload,
        DiskPhase::WaitForFirstConsumer => Phase::WaitForFirstConsumer,
        DiskPhase::Provisioning => Phase::Provisioning,
        DiskPhase::Ready => Phase::Ready,
        DiskPhase::Failed => Phase::Failed,
        DiskPhase::Lost => Phase::Lost,
        DiskPhase::PvcLost => Phase::PvcLost,
        DiskPhase::Terminating => Phase::Terminating,
    }
}

fn reset_image_status(status: &mut ImageStatus) {
    *status = ImageStatus {
        conditions: std::mem::take(&mut status.conditions),
        used_in_namespaces: std::mem::take(&mut status.used_in_namespaces),
        ..Default::default()
    };
}

/// Status accessors shared by the two image kinds.
macro_rules! image_status_accessors {
    () => {
        fn data_source(&self) -> &DataSource {
            &self.spec.data_source
        }

        fn conditions(&self) -> &[Condition] {
            self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default()
        }

        fn conditions_mut(&mut self) -> &mut Vec<Condition> {
            &mut self.status.get_or_insert_with(Default::default).conditions
        }

        fn phase(&self) -> Phase {
            from_image_phase(self.status.as_ref().map(|s| s.phase).unwrap_or_default())
        }

        fn set_phase(&mut self, phase: Phase) {
            self.status.get_or_insert_with(Default::default).phase = image_phase(phase);
        }

        fn progress(&self) -> &str {
            self.status.as_ref().map(|s| s.progress.as_str()).unwrap_or_default()
        }

        fn set_progress(&mut self, progress: String) {
            self.status.get_or_insert_with(Default::default).progress = progress;
        }

        fn set_download_speed(&mut self, speed: Option<StatusSpeed>) {
            self.status.get_or_insert_with(Default::default).download_speed = speed;
        }

        fn set_upload_urls(&mut self, urls: Option<ImageUploadUrls>) {
            self.status.get_or_insert_with(Default::default).image_upload_urls = urls;
        }

        fn set_import_result(&mut self, result: ImportResult) {
            let status = self.status.get_or_insert_with(Default::default);
            status.size = result.size;
            status.format = result.format;
            status.cdrom = result.cdrom;
        }

        fn target_registry_url(&self) -> &str {
            self.status
                .as_ref()
                .map(|s| s.target.registry_url.as_str())
                .unwrap_or_default()
        }

        fn set_target_registry_url(&mut self, url: String) {
            self.status.get_or_insert_with(Default::default).target.registry_url = url;
        }

        fn set_target_pvc(&mut self, pvc: String) {
            self.status.get_or_insert_with(Default::default).target.pvc_name = pvc;
        }

        fn set_storage_class_name(&mut self, name: String) {
            self.status.get_or_insert_with(Default::default).storage_class_name = name;
        }

        fn set_observed_generation(&mut self, generation: i64) {
            self.status.get_or_insert_with(Default::default).observed_generation = generation;
        }

        fn reset_status(&mut self) {
            reset_image_status(self.status.get_or_insert_with(Default::default));
        }
    };
}

impl Provisionable for ClusterVirtualImage {
    const SHORT_KIND: &'static str = "cvi";
    const CLEANUP_FINALIZER: &'static str = FINALIZER_CVI_CLEANUP;
    const PROTECTION_FINALIZER: &'static str = FINALIZER_CVI_PROTECTION;
    const BLOCK_DEVICE_KIND: BlockDeviceKind = BlockDeviceKind::ClusterVirtualImage;
    const OBJECT_REF_KIND: ObjectRefKind = ObjectRefKind::ClusterVirtualImage;

    image_status_accessors!();

    fn set_used_in_namespaces(&mut self, namespaces: Vec<String>) {
        self.status.get_or_insert_with(Default::default).used_in_namespaces = namespaces;
    }

    fn is_stored_on_pvc(&self) -> bool {
        false
    }

    fn dvcr_image(&self, dvcr: &DvcrSettings) -> String {
        dvcr.registry_image_for_cvi(self.metadata.name.as_deref().unwrap_or_default())
    }
}

impl Provisionable for VirtualImage {
    const SHORT_KIND: &'static str = "vi";
    const CLEANUP_FINALIZER: &'static str = FINALIZER_VI_CLEANUP;
    const PROTECTION_FINALIZER: &'static str = FINALIZER_VI_PROTECTION;
    const BLOCK_DEVICE_KIND: BlockDeviceKind = BlockDeviceKind::VirtualImage;
    const OBJECT_REF_KIND: ObjectRefKind = ObjectRefKind::VirtualImage;

    image_status_accessors!();

    fn is_stored_on_pvc(&self) -> bool {
        VirtualImage::is_stored_on_pvc(self)
    }

    fn storage_class(&self) -> Option<&str> {
        self.spec.persistent_volume_claim.as_ref()?.storage_class_name.as_deref()
    }

    fn dvcr_image(&self, dvcr: &DvcrSettings) -> String {
        dvcr.registry_image_for_vi(
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default(),
        )
    }
}

impl Provisionable for VirtualDisk {
    const SHORT_KIND: &'static str = "vd";
    const CLEANUP_FINALIZER: &'static str = FINALIZER_VD_CLEANUP;
    const PROTECTION_FINALIZER: &'static str = FINALIZER_VD_PROTECTION;
    const BLOCK_DEVICE_KIND: BlockDeviceKind = BlockDeviceKind::VirtualDisk;
    const OBJECT_REF_KIND: ObjectRefKind = ObjectRefKind::VirtualDisk;

    fn data_source(&self) -> &DataSource {
        &self.spec.data_source
    }

    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or_default()
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }

    fn phase(&self) -> Phase {
        from_disk_phase(self.status.as_ref().map(|s| s.phase).unwrap_or_default())
    }

    fn set_phase(&mut self, phase: Phase) {
        self.status.get_or_insert_with(Default::default).phase = disk_phase(phase);
    }

    fn progress(&self) -> &str {
        self.status.as_ref().map(|s| s.progress.as_str()).unwrap_or_default()
    }

    fn set_progress(&mut self, progress: String) {
        self.status.get_or_insert_with(Default::default).progress = progress;
    }

    fn set_download_speed(&mut self, speed: Option<StatusSpeed>) {
        self.status.get_or_insert_with(Default::default).download_speed = speed;
    }

    fn set_upload_urls(&mut self, urls: Option<ImageUploadUrls>) {
        self.status.get_or_insert_with(Default::default).image_upload_urls = urls;
    }

    fn set_import_result(&mut self, _result: ImportResult) {}

    fn target_registry_url(&self) -> &str {
        ""
    }

    fn set_target_registry_url(&mut self, _url: String) {}

    fn set_target_pvc(&mut self, pvc: String) {
        self.status.get_or_insert_with(Default::default).target.pvc_name = pvc;
    }

    fn set_capacity(&mut self, capacity: String) {
        self.status.get_or_insert_with(Default::default).capacity = capacity;
    }

    fn set_storage_class_name(&mut self, name: String) {
        self.status.get_or_insert_with(Default::default).storage_class_name = name;
    }

    fn set_observed_generation(&mut self, generation: i64) {
        self.status.get_or_insert_with(Default::default).observed_generation = generation;
    }

    fn is_stored_on_pvc(&self) -> bool {
        true
    }

    fn storage_class(&self) -> Option<&str> {
        self.spec.persistent_volume_claim.storage_class_name.as_deref()
    }

    fn requested_size(&self) -> Option<&str> {
        self.spec.persistent_volume_claim.size.as_deref()
    }

    fn reset_status(&mut self) {
        let status = self.status.get_or_insert_with(Default::default);
        *status = crds::VirtualDiskStatus {
            conditions: std::mem::take(&mut status.conditions),
            ..Default::default()
        };
    }

    fn dvcr_image(&self, dvcr: &DvcrSettings) -> String {
        dvcr.registry_image_for_vd(
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_cvi, create_test_vd};

    #[test]
    fn test_disk_only_phase_maps_onto_images() {
        let mut cvi = create_test_cvi("ubuntu");
        cvi.set_phase(Phase::WaitForFirstConsumer);
        assert_eq!(cvi.status.as_ref().unwrap().phase, ImagePhase::Provisioning);

        let mut vd = create_test_vd("root", "default");
        vd.set_phase(Phase::WaitForFirstConsumer);
        assert_eq!(vd.phase(), Phase::WaitForFirstConsumer);
    }

    #[test]
    fn test_reset_keeps_conditions() {
        let mut cvi = create_test_cvi("ubuntu");
        cvi.set_phase(Phase::Ready);
        cvi.set_progress("100%".to_string());
        cvi.conditions_mut().push(crds::conditions::ConditionBuilder::new("Ready").build());

        cvi.reset_status();

        assert_eq!(cvi.phase(), Phase::Pending);
        assert!(cvi.progress().is_empty());
        assert_eq!(cvi.conditions().len(), 1);
    }

    #[test]
    fn test_cluster_image_supplements_live_in_controller_namespace() {
        let cvi = create_test_cvi("ubuntu");
        let vd = create_test_vd("root", "default");

        assert_eq!(cvi.supplements("d8-virtualization").namespace(), "d8-virtualization");
        assert_eq!(vd.supplements("d8-virtualization").namespace(), "default");
    }
}
