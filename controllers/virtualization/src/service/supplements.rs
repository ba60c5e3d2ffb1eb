//! Names of supplementary objects.
//!
//! Every image or disk owns a set of short-lived objects: the importer or
//! uploader Pod, the uploader Service and Ingress, copies of registry
//! credentials and CA bundles, and the DataVolume that fills its PVC. Names
//! derive from the owner's kind, name and uid so two owners never collide.

use sha2::{Digest, Sha256};

use crate::store::ObjectKey;

/// Longest name accepted for Services and label values.
const MAX_NAME_LENGTH: usize = 63;

const HASH_LENGTH: usize = 8;

/// Supplementary object names of one owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Supplements {
    short_kind: &'static str,
    name: String,
    namespace: String,
    uid: String,
}

fn shorten(name: String) -> String {
    if name.len() <= MAX_NAME_LENGTH {
        return name;
    }
    let hash = hex::encode(Sha256::digest(name.as_bytes()));
    let keep = MAX_NAME_LENGTH - HASH_LENGTH - 1;
    let prefix: String = name.chars().take(keep).collect();
    format!("{}-{}", prefix.trim_end_matches('-'), &hash[..HASH_LENGTH])
}

impl Supplements {
    /// Creates names for an owner whose supplements live in `namespace`.
    pub fn new(short_kind: &'static str, name: &str, namespace: &str, uid: &str) -> Self {
        Self {
            short_kind,
            name: name.to_string(),
            namespace: namespace.to_string(),
            uid: uid.to_string(),
        }
    }

    /// Namespace of the supplementary objects.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, role: &str) -> ObjectKey {
        let name = shorten(format!("d8v-{}-{}-{}-{}", self.short_kind, role, self.name, self.uid));
        ObjectKey::namespaced(self.namespace.clone(), name)
    }

    /// Importer Pod.
    pub fn importer_pod(&self) -> ObjectKey {
        self.key("importer")
    }

    /// Uploader Pod.
    pub fn uploader_pod(&self) -> ObjectKey {
        self.key("uploader")
    }

    /// Uploader Service.
    pub fn uploader_service(&self) -> ObjectKey {
        self.key("uploader-svc")
    }

    /// Uploader Ingress.
    pub fn uploader_ingress(&self) -> ObjectKey {
        self.key("uploader-ing")
    }

    /// Copy of the DVCR credentials next to the Pods.
    pub fn dvcr_auth_secret(&self) -> ObjectKey {
        self.key("dvcr-auth")
    }

    /// Copy of the source registry pull Secret next to the Pods.
    pub fn pull_secret(&self) -> ObjectKey {
        self.key("pull-secret")
    }

    /// ConfigMap with the source CA bundle.
    pub fn ca_bundle_config_map(&self) -> ObjectKey {
        self.key("ca")
    }

    /// DataVolume and the PVC it fills.
    pub fn data_volume(&self) -> ObjectKey {
        ObjectKey::namespaced(self.namespace.clone(), shorten(format!("d8v-{}-{}", self.short_kind, self.uid)))
    }

    /// PVC restored from a VolumeSnapshot.
    pub fn restored_pvc(&self) -> ObjectKey {
        self.key("restore")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_include_kind_and_uid() {
        let sup = Supplements::new("vi", "alpine", "ns", "1234");

        assert_eq!(sup.importer_pod(), ObjectKey::namespaced("ns", "d8v-vi-importer-alpine-1234"));
        assert_eq!(sup.uploader_pod().name, "d8v-vi-uploader-alpine-1234");
        assert_eq!(sup.data_volume().name, "d8v-vi-1234");
    }

    #[test]
    fn test_long_names_are_shortened_deterministically() {
        let uid = "0b2c6b8f-93a9-4c7e-8f3e-0d5a52b2f1aa";
        let sup = Supplements::new("cvi", "a-very-long-cluster-image-name-for-testing", "d8-virtualization", uid);

        let first = sup.uploader_service().name;
        assert_eq!(first.len(), MAX_NAME_LENGTH);
        assert_eq!(first, sup.uploader_service().name);
        assert_ne!(first, sup.uploader_ingress().name);
    }
}
