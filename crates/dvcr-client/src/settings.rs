//! DVCR settings
//!
//! Immutable registry configuration passed by reference to everything that
//! computes image locations or talks to the registry.

/// Registry configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DvcrSettings {
    /// Registry host with an optional path prefix, e.g. `dvcr.d8-virtualization.svc`
    pub registry_url: String,
    /// Secret with a docker config for the registry
    pub auth_secret: Option<String>,
    /// Namespace of the auth Secret
    pub auth_secret_namespace: Option<String>,
    /// Secret with the registry CA (`ca.crt`)
    pub certs_secret: Option<String>,
    /// Namespace of the certs Secret
    pub certs_secret_namespace: Option<String>,
    /// Skip TLS verification
    pub insecure_tls: bool,
}

const CVI_IMAGE_PATH: &str = "cvi";
const VI_IMAGE_PATH: &str = "vi";
const VD_IMAGE_PATH: &str = "vd";
const IMAGE_TAG: &str = "latest";

impl DvcrSettings {
    /// Creates settings for a registry without credentials.
    pub fn new(registry_url: impl Into<String>) -> Self {
        Self {
            registry_url: registry_url.into().trim_end_matches('/').to_string(),
            ..Default::default()
        }
    }

    /// Image location of a ClusterVirtualImage.
    #[must_use]
    pub fn registry_image_for_cvi(&self, name: &str) -> String {
        format!("{}/{CVI_IMAGE_PATH}/{name}:{IMAGE_TAG}", self.registry_url)
    }

    /// Image location of a VirtualImage.
    #[must_use]
    pub fn registry_image_for_vi(&self, namespace: &str, name: &str) -> String {
        format!("{}/{VI_IMAGE_PATH}/{namespace}/{name}:{IMAGE_TAG}", self.registry_url)
    }

    /// Intermediate image location of a VirtualDisk.
    #[must_use]
    pub fn registry_image_for_vd(&self, namespace: &str, name: &str) -> String {
        format!("{}/{VD_IMAGE_PATH}/{namespace}/{name}:{IMAGE_TAG}", self.registry_url)
    }

    /// Returns true when both the auth Secret name and namespace are set.
    #[must_use]
    pub fn has_auth_secret(&self) -> bool {
        self.auth_secret.is_some() && self.auth_secret_namespace.is_some()
    }
}
