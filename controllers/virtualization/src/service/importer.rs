//! Importer Pods
//!
//! An importer Pod copies data from an HTTP server, a container registry,
//! another DVCR image or a block device into DVCR. Registry credentials and
//! CA bundles are copied next to the Pod first; the Pod is created with a
//! protection finalizer and owned by the image or disk it provisions.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EnvVar, PersistentVolumeClaimVolumeSource, Pod, PodSpec, Secret,
    SecretVolumeSource, Volume, VolumeDevice, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use tracing::{debug, info};

use crds::annotations::{ANN_CREATED_BY_NAME, ANN_CREATED_BY_NAMESPACE, FINALIZER_POD_PROTECTION};
use dvcr_client::DvcrSettings;

use super::ServiceError;
use super::protection::ProtectionService;
use super::supplements::Supplements;
use crate::store::{Object, ObjectKey, Store, StoreError};

/// Name of the importer container.
pub const IMPORTER_CONTAINER: &str = "d8v-dvcr-importer";

/// Env var with the DVCR image the importer writes.
pub const IMPORTER_DESTINATION_ENDPOINT: &str = "IMPORTER_DESTINATION_ENDPOINT";

const IMPORTER_SOURCE: &str = "IMPORTER_SOURCE";
const IMPORTER_ENDPOINT: &str = "IMPORTER_ENDPOINT";
const IMPORTER_SHA256SUM: &str = "IMPORTER_SHA256SUM";
const IMPORTER_MD5SUM: &str = "IMPORTER_MD5SUM";
const IMPORTER_AUTH_CONFIG: &str = "IMPORTER_AUTH_CONFIG";
const IMPORTER_DESTINATION_AUTH_CONFIG: &str = "IMPORTER_DESTINATION_AUTH_CONFIG";
const IMPORTER_CERT_DIR: &str = "IMPORTER_CERT_DIR";
const INSECURE_TLS: &str = "INSECURE_TLS";
const DESTINATION_INSECURE_TLS: &str = "DESTINATION_INSECURE_TLS";

const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";
const DOCKER_CONFIG_TYPE: &str = "kubernetes.io/dockerconfigjson";
const CA_BUNDLE_KEY: &str = "ca.crt";

const DESTINATION_AUTH_VOLUME: &str = "dvcr-secret-vol";
const DESTINATION_AUTH_DIR: &str = "/dvcr-auth";
const SOURCE_AUTH_VOLUME: &str = "source-registry-secret-vol";
const SOURCE_AUTH_DIR: &str = "/source-registry-auth";
const CA_BUNDLE_VOLUME: &str = "ca-bundle-vol";
const CA_BUNDLE_DIR: &str = "/certs";
const BLOCK_DEVICE_VOLUME: &str = "volume";
const BLOCK_DEVICE_PATH: &str = "/dev/xvda";

/// Where the importer reads data from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOrigin {
    /// File on an HTTP(S) server
    Http {
        /// File URL
        url: String,
        /// Expected SHA-256 sum
        sha256: Option<String>,
        /// Expected MD5 sum
        md5: Option<String>,
        /// Base64-encoded CA bundle
        ca_bundle: Option<String>,
    },
    /// Image in a container registry
    Registry {
        /// Image reference
        image: String,
        /// Pull Secret to copy next to the Pod
        pull_secret: Option<ObjectKey>,
        /// Base64-encoded CA bundle
        ca_bundle: Option<String>,
    },
    /// Another image in DVCR
    Dvcr {
        /// Image location
        image: String,
    },
    /// PVC mounted into the Pod as a block device
    BlockDevice {
        /// PVC in the Pod namespace
        pvc_name: String,
    },
}

impl ImportOrigin {
    fn source_type(&self) -> &'static str {
        match self {
            Self::Http { .. } => "http",
            Self::Registry { .. } => "registry",
            Self::Dvcr { .. } => "dvcr",
            Self::BlockDevice { .. } => "blockDevice",
        }
    }

    fn ca_bundle(&self) -> Option<&str> {
        match self {
            Self::Http { ca_bundle, .. } | Self::Registry { ca_bundle, .. } => {
                ca_bundle.as_deref().filter(|b| !b.is_empty())
            }
            Self::Dvcr { .. } | Self::BlockDevice { .. } => None,
        }
    }
}

/// Identity of a supplementary Pod.
#[derive(Debug, Clone)]
pub struct PodSettings {
    /// Pod name and namespace
    pub key: ObjectKey,
    /// Owner of the Pod
    pub owner_reference: OwnerReference,
    /// Name of the owner, for the created-by annotations
    pub owner_name: String,
    /// Namespace of the owner, empty for cluster-scoped owners
    pub owner_namespace: String,
}

impl PodSettings {
    /// Settings of a Pod owned by `owner`.
    pub fn for_owner<K: Object>(key: ObjectKey, owner: &K) -> Self {
        Self {
            key,
            owner_reference: crate::meta::controller_reference(owner),
            owner_name: owner.meta().name.clone().unwrap_or_default(),
            owner_namespace: owner.meta().namespace.clone().unwrap_or_default(),
        }
    }

    pub(super) fn metadata(&self) -> ObjectMeta {
        let mut annotations = BTreeMap::from([(ANN_CREATED_BY_NAME.to_string(), self.owner_name.clone())]);
        if !self.owner_namespace.is_empty() {
            annotations.insert(ANN_CREATED_BY_NAMESPACE.to_string(), self.owner_namespace.clone());
        }
        ObjectMeta {
            name: Some(self.key.name.clone()),
            namespace: self.key.namespace.clone(),
            owner_references: Some(vec![self.owner_reference.clone()]),
            annotations: Some(annotations),
            ..Default::default()
        }
    }
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

pub(super) async fn create_if_missing<K: Object>(store: &Store, obj: &K) -> Result<(), StoreError> {
    match store.create(obj).await {
        Ok(_) | Err(StoreError::AlreadyExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Copies a docker config Secret to `target`; returns false when the source is absent.
pub(super) async fn copy_docker_config(store: &Store, source: &ObjectKey, target: &ObjectKey) -> Result<bool, ServiceError> {
    let Some(secret) = store.get_by_key::<Secret>(source).await? else {
        return Ok(false);
    };
    let copy = Secret {
        metadata: ObjectMeta {
            name: Some(target.name.clone()),
            namespace: target.namespace.clone(),
            ..Default::default()
        },
        type_: Some(DOCKER_CONFIG_TYPE.to_string()),
        data: secret.data,
        ..Default::default()
    };
    create_if_missing(store, &copy).await?;
    Ok(true)
}

/// Copies the DVCR credentials next to the Pod; returns false when DVCR needs none.
pub(super) async fn ensure_dvcr_auth(store: &Store, dvcr: &DvcrSettings, sup: &Supplements) -> Result<bool, ServiceError> {
    let (Some(name), Some(namespace)) = (dvcr.auth_secret.as_ref(), dvcr.auth_secret_namespace.as_ref()) else {
        return Ok(false);
    };
    let source = ObjectKey::namespaced(namespace.clone(), name.clone());
    if !copy_docker_config(store, &source, &sup.dvcr_auth_secret()).await? {
        return Err(ServiceError::MissingField(format!("DVCR auth secret {source} not found")));
    }
    Ok(true)
}

/// Deletes the supplementary Secrets and ConfigMap; returns true if any existed.
pub(super) async fn delete_supplements(store: &Store, sup: &Supplements) -> Result<bool, ServiceError> {
    let mut found = false;
    for key in [sup.dvcr_auth_secret(), sup.pull_secret()] {
        if store.get_by_key::<Secret>(&key).await?.is_some() {
            store.delete::<Secret>(key.namespace.as_deref(), &key.name).await?;
            found = true;
        }
    }
    let ca = sup.ca_bundle_config_map();
    if store.get_by_key::<ConfigMap>(&ca).await?.is_some() {
        store.delete::<ConfigMap>(ca.namespace.as_deref(), &ca.name).await?;
        found = true;
    }
    Ok(found)
}

/// Creates and tracks importer Pods.
#[derive(Debug, Clone)]
pub struct ImporterService {
    store: Store,
    image: String,
    dvcr: Arc<DvcrSettings>,
    protection: ProtectionService,
}

impl ImporterService {
    /// Creates a service running Pods from `image`.
    pub fn new(store: Store, image: impl Into<String>, dvcr: Arc<DvcrSettings>) -> Self {
        Self {
            protection: ProtectionService::new(store.clone(), FINALIZER_POD_PROTECTION),
            store,
            image: image.into(),
            dvcr,
        }
    }

    /// Starts an importer writing `origin` into the DVCR image `destination`.
    pub async fn start(
        &self,
        origin: &ImportOrigin,
        destination: &str,
        sup: &Supplements,
        settings: &PodSettings,
    ) -> Result<(), ServiceError> {
        let has_dvcr_auth = ensure_dvcr_auth(&self.store, &self.dvcr, sup).await?;

        let has_pull_secret = match origin {
            ImportOrigin::Registry {
                pull_secret: Some(source),
                ..
            } => {
                if !copy_docker_config(&self.store, source, &sup.pull_secret()).await? {
                    return Err(ServiceError::MissingField(format!("pull secret {source} not found")));
                }
                true
            }
            _ => false,
        };

        let has_ca_bundle = match origin.ca_bundle() {
            Some(bundle) => {
                self.ensure_ca_bundle(bundle, sup).await?;
                true
            }
            None => false,
        };

        let pod = self.make_pod(origin, destination, sup, settings, has_dvcr_auth, has_pull_secret, has_ca_bundle);
        info!("Starting importer Pod {} for {}", settings.key, destination);
        create_if_missing(&self.store, &pod).await?;
        Ok(())
    }

    async fn ensure_ca_bundle(&self, bundle: &str, sup: &Supplements) -> Result<(), ServiceError> {
        let decoded = base64::engine::general_purpose::STANDARD.decode(bundle.trim())?;
        let key = sup.ca_bundle_config_map();
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(key.name.clone()),
                namespace: key.namespace.clone(),
                ..Default::default()
            },
            binary_data: Some(BTreeMap::from([(CA_BUNDLE_KEY.to_string(), ByteString(decoded))])),
            ..Default::default()
        };
        create_if_missing(&self.store, &config_map).await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn make_pod(
        &self,
        origin: &ImportOrigin,
        destination: &str,
        sup: &Supplements,
        settings: &PodSettings,
        has_dvcr_auth: bool,
        has_pull_secret: bool,
        has_ca_bundle: bool,
    ) -> Pod {
        let mut envs = vec![
            env(IMPORTER_SOURCE, origin.source_type()),
            env(IMPORTER_DESTINATION_ENDPOINT, destination),
            env(DESTINATION_INSECURE_TLS, self.dvcr.insecure_tls.to_string()),
        ];
        let mut volumes = Vec::new();
        let mut mounts = Vec::new();
        let mut devices = Vec::new();

        match origin {
            ImportOrigin::Http { url, sha256, md5, .. } => {
                envs.push(env(IMPORTER_ENDPOINT, url));
                envs.extend(sha256.iter().filter(|s| !s.is_empty()).map(|s| env(IMPORTER_SHA256SUM, s)));
                envs.extend(md5.iter().filter(|s| !s.is_empty()).map(|s| env(IMPORTER_MD5SUM, s)));
            }
            ImportOrigin::Registry { image, .. } => {
                envs.push(env(IMPORTER_ENDPOINT, image));
            }
            ImportOrigin::Dvcr { image } => {
                envs.push(env(IMPORTER_ENDPOINT, image));
                envs.push(env(INSECURE_TLS, self.dvcr.insecure_tls.to_string()));
                if has_dvcr_auth {
                    envs.push(env(IMPORTER_AUTH_CONFIG, format!("{DESTINATION_AUTH_DIR}/{DOCKER_CONFIG_KEY}")));
                }
            }
            ImportOrigin::BlockDevice { pvc_name } => {
                envs.push(env(IMPORTER_ENDPOINT, BLOCK_DEVICE_PATH));
                volumes.push(Volume {
                    name: BLOCK_DEVICE_VOLUME.to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: pvc_name.clone(),
                        read_only: Some(true),
                    }),
                    ..Default::default()
                });
                devices.push(VolumeDevice {
                    name: BLOCK_DEVICE_VOLUME.to_string(),
                    device_path: BLOCK_DEVICE_PATH.to_string(),
                });
            }
        }

        if has_dvcr_auth {
            envs.push(env(IMPORTER_DESTINATION_AUTH_CONFIG, format!("{DESTINATION_AUTH_DIR}/{DOCKER_CONFIG_KEY}")));
            volumes.push(secret_volume(DESTINATION_AUTH_VOLUME, &sup.dvcr_auth_secret().name));
            mounts.push(mount(DESTINATION_AUTH_VOLUME, DESTINATION_AUTH_DIR));
        }
        if has_pull_secret {
            envs.push(env(IMPORTER_AUTH_CONFIG, format!("{SOURCE_AUTH_DIR}/{DOCKER_CONFIG_KEY}")));
            volumes.push(secret_volume(SOURCE_AUTH_VOLUME, &sup.pull_secret().name));
            mounts.push(mount(SOURCE_AUTH_VOLUME, SOURCE_AUTH_DIR));
        }
        if has_ca_bundle {
            envs.push(env(IMPORTER_CERT_DIR, CA_BUNDLE_DIR));
            volumes.push(Volume {
                name: CA_BUNDLE_VOLUME.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: sup.ca_bundle_config_map().name,
                    ..Default::default()
                }),
                ..Default::default()
            });
            mounts.push(mount(CA_BUNDLE_VOLUME, CA_BUNDLE_DIR));
        }

        let mut metadata = settings.metadata();
        metadata.finalizers = Some(vec![FINALIZER_POD_PROTECTION.to_string()]);

        Pod {
            metadata,
            spec: Some(PodSpec {
                restart_policy: Some("OnFailure".to_string()),
                containers: vec![Container {
                    name: IMPORTER_CONTAINER.to_string(),
                    image: Some(self.image.clone()),
                    image_pull_policy: Some("IfNotPresent".to_string()),
                    env: Some(envs),
                    volume_mounts: (!mounts.is_empty()).then_some(mounts),
                    volume_devices: (!devices.is_empty()).then_some(devices),
                    ..Default::default()
                }],
                volumes: (!volumes.is_empty()).then_some(volumes),
                ..Default::default()
            }),
            status: None,
        }
    }

    /// Returns the importer Pod of the owner.
    pub async fn get_pod(&self, sup: &Supplements) -> Result<Option<Pod>, ServiceError> {
        Ok(self.store.get_by_key(&sup.importer_pod()).await?)
    }

    /// Keeps the Pod from being deleted while its result is needed.
    pub async fn protect(&self, pod: &Pod) -> Result<(), ServiceError> {
        Ok(self.protection.protect(pod).await?)
    }

    /// Releases the Pod.
    pub async fn unprotect(&self, pod: &Pod) -> Result<(), ServiceError> {
        Ok(self.protection.unprotect(pod).await?)
    }

    /// Deletes the Pod and its supplements; returns true if anything existed.
    pub async fn clean_up(&self, sup: &Supplements) -> Result<bool, ServiceError> {
        let mut found = self.clean_up_supplements(sup).await?;
        if let Some(pod) = self.get_pod(sup).await? {
            debug!("Deleting importer Pod {}", sup.importer_pod());
            self.protection.unprotect(&pod).await?;
            self.store.delete_object(&pod).await?;
            found = true;
        }
        Ok(found)
    }

    /// Deletes the copied Secrets and CA bundle only.
    pub async fn clean_up_supplements(&self, sup: &Supplements) -> Result<bool, ServiceError> {
        delete_supplements(&self.store, sup).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_cvi, memory_store};

    fn env_value<'a>(pod: &'a Pod, name: &str) -> Option<&'a str> {
        pod.spec.as_ref()?.containers[0]
            .env
            .as_ref()?
            .iter()
            .find(|e| e.name == name)?
            .value
            .as_deref()
    }

    #[tokio::test]
    async fn test_start_creates_protected_pod_with_http_settings() {
        let (store, _) = memory_store();
        let service = ImporterService::new(store, "importer:v1", Arc::new(DvcrSettings::new("dvcr")));
        let cvi = create_test_cvi("ubuntu");
        let sup = Supplements::new("cvi", "ubuntu", "d8-virtualization", "uid-1");
        let origin = ImportOrigin::Http {
            url: "https://example.com/a.iso".to_string(),
            sha256: Some("abc".to_string()),
            md5: None,
            ca_bundle: None,
        };

        service
            .start(&origin, "dvcr/cvi/ubuntu:latest", &sup, &PodSettings::for_owner(sup.importer_pod(), &cvi))
            .await
            .unwrap();

        let pod = service.get_pod(&sup).await.unwrap().unwrap();
        assert_eq!(env_value(&pod, IMPORTER_SOURCE), Some("http"));
        assert_eq!(env_value(&pod, IMPORTER_ENDPOINT), Some("https://example.com/a.iso"));
        assert_eq!(env_value(&pod, IMPORTER_SHA256SUM), Some("abc"));
        assert_eq!(env_value(&pod, IMPORTER_DESTINATION_ENDPOINT), Some("dvcr/cvi/ubuntu:latest"));
        assert!(crate::meta::has_finalizer(&pod, FINALIZER_POD_PROTECTION));
        assert_eq!(pod.spec.unwrap().restart_policy.as_deref(), Some("OnFailure"));
    }

    #[tokio::test]
    async fn test_missing_pull_secret_is_an_error() {
        let (store, _) = memory_store();
        let service = ImporterService::new(store, "importer:v1", Arc::new(DvcrSettings::new("dvcr")));
        let cvi = create_test_cvi("ubuntu");
        let sup = Supplements::new("cvi", "ubuntu", "d8-virtualization", "uid-1");
        let origin = ImportOrigin::Registry {
            image: "registry.example.com/ubuntu:22.04".to_string(),
            pull_secret: Some(ObjectKey::namespaced("default", "missing")),
            ca_bundle: None,
        };

        let result = service
            .start(&origin, "dvcr/cvi/ubuntu:latest", &sup, &PodSettings::for_owner(sup.importer_pod(), &cvi))
            .await;

        assert!(matches!(result, Err(ServiceError::MissingField(_))));
        assert!(service.get_pod(&sup).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clean_up_removes_pod_and_ca_bundle() {
        let (store, backend) = memory_store();
        let service = ImporterService::new(store, "importer:v1", Arc::new(DvcrSettings::new("dvcr")));
        let cvi = create_test_cvi("ubuntu");
        let sup = Supplements::new("cvi", "ubuntu", "d8-virtualization", "uid-1");
        let origin = ImportOrigin::Http {
            url: "https://example.com/a.iso".to_string(),
            sha256: None,
            md5: None,
            ca_bundle: Some("Y2VydA==".to_string()),
        };
        service
            .start(&origin, "dvcr/cvi/ubuntu:latest", &sup, &PodSettings::for_owner(sup.importer_pod(), &cvi))
            .await
            .unwrap();
        assert_eq!(backend.count("ConfigMap"), 1);

        assert!(service.clean_up(&sup).await.unwrap());

        assert!(service.get_pod(&sup).await.unwrap().is_none());
        assert_eq!(backend.count("ConfigMap"), 0);
        assert!(!service.clean_up(&sup).await.unwrap());
    }
}
