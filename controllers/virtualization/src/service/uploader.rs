//! Uploader Pods
//!
//! The uploader accepts one file over HTTP and writes it into DVCR. It is
//! reached through a Service and an Ingress whose upload URL is published
//! in an annotation.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Container, ContainerPort, EnvVar, Pod, PodSpec, Service, ServicePort, ServiceSpec, Volume, VolumeMount, SecretVolumeSource};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule, IngressServiceBackend, IngressSpec,
    IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crds::annotations::{ANN_UPLOAD_URL, FINALIZER_POD_PROTECTION, LABEL_UPLOADER_SERVICE};
use dvcr_client::DvcrSettings;

use super::ServiceError;
use super::importer::{PodSettings, create_if_missing, delete_supplements, ensure_dvcr_auth};
use super::protection::ProtectionService;
use super::supplements::Supplements;
use crate::meta;
use crate::store::Store;

/// Name of the uploader container.
pub const UPLOADER_CONTAINER: &str = "d8v-dvcr-uploader";

/// Env var with the DVCR image the uploader writes.
pub const UPLOADER_DESTINATION_ENDPOINT: &str = "UPLOADER_DESTINATION_ENDPOINT";

const UPLOADER_DESTINATION_AUTH_CONFIG: &str = "UPLOADER_DESTINATION_AUTH_CONFIG";
const DESTINATION_INSECURE_TLS: &str = "DESTINATION_INSECURE_TLS";
const UPLOADER_PORT: i32 = 8000;
const SERVICE_PORT: i32 = 80;
const DESTINATION_AUTH_VOLUME: &str = "dvcr-secret-vol";
const DESTINATION_AUTH_DIR: &str = "/dvcr-auth";

/// How the upload Ingress is exposed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploaderIngressSettings {
    /// External host name
    pub host: String,
    /// TLS Secret for the host
    pub tls_secret: Option<String>,
    /// Ingress class
    pub class: Option<String>,
}

/// Creates and tracks uploader Pods, Services and Ingresses.
#[derive(Debug, Clone)]
pub struct UploaderService {
    store: Store,
    image: String,
    dvcr: Arc<DvcrSettings>,
    ingress: Arc<UploaderIngressSettings>,
    protection: ProtectionService,
}

fn upload_path(sup: &Supplements) -> String {
    let digest = hex::encode(Sha256::digest(sup.uploader_ingress().to_string().as_bytes()));
    format!("/upload/{}", &digest[..32])
}

impl UploaderService {
    /// Creates a service running Pods from `image`.
    pub fn new(
        store: Store,
        image: impl Into<String>,
        dvcr: Arc<DvcrSettings>,
        ingress: Arc<UploaderIngressSettings>,
    ) -> Self {
        Self {
            protection: ProtectionService::new(store.clone(), FINALIZER_POD_PROTECTION),
            store,
            image: image.into(),
            dvcr,
            ingress,
        }
    }

    /// Starts the uploader Pod, its Service and its Ingress.
    pub async fn start(&self, destination: &str, sup: &Supplements, settings: &PodSettings) -> Result<(), ServiceError> {
        let has_dvcr_auth = ensure_dvcr_auth(&self.store, &self.dvcr, sup).await?;

        info!("Starting uploader Pod {} for {}", settings.key, destination);
        create_if_missing(&self.store, &self.make_pod(destination, sup, settings, has_dvcr_auth)).await?;
        create_if_missing(&self.store, &self.make_service(sup, settings)).await?;
        create_if_missing(&self.store, &self.make_ingress(sup, settings)).await?;
        Ok(())
    }

    fn make_pod(&self, destination: &str, sup: &Supplements, settings: &PodSettings, has_dvcr_auth: bool) -> Pod {
        let env = |name: &str, value: String| EnvVar {
            name: name.to_string(),
            value: Some(value),
            ..Default::default()
        };
        let mut envs = vec![
            env(UPLOADER_DESTINATION_ENDPOINT, destination.to_string()),
            env(DESTINATION_INSECURE_TLS, self.dvcr.insecure_tls.to_string()),
        ];
        let mut volumes = Vec::new();
        let mut mounts = Vec::new();
        if has_dvcr_auth {
            envs.push(env(UPLOADER_DESTINATION_AUTH_CONFIG, format!("{DESTINATION_AUTH_DIR}/.dockerconfigjson")));
            volumes.push(Volume {
                name: DESTINATION_AUTH_VOLUME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(sup.dvcr_auth_secret().name),
                    ..Default::default()
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: DESTINATION_AUTH_VOLUME.to_string(),
                mount_path: DESTINATION_AUTH_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
        }

        let mut metadata = settings.metadata();
        metadata.finalizers = Some(vec![FINALIZER_POD_PROTECTION.to_string()]);
        metadata.labels = Some(BTreeMap::from([(
            LABEL_UPLOADER_SERVICE.to_string(),
            sup.uploader_service().name,
        )]));

        Pod {
            metadata,
            spec: Some(PodSpec {
                restart_policy: Some("OnFailure".to_string()),
                containers: vec![Container {
                    name: UPLOADER_CONTAINER.to_string(),
                    image: Some(self.image.clone()),
                    image_pull_policy: Some("IfNotPresent".to_string()),
                    env: Some(envs),
                    ports: Some(vec![ContainerPort {
                        name: Some("uploader".to_string()),
                        container_port: UPLOADER_PORT,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    }]),
                    volume_mounts: (!mounts.is_empty()).then_some(mounts),
                    ..Default::default()
                }],
                volumes: (!volumes.is_empty()).then_some(volumes),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn make_service(&self, sup: &Supplements, settings: &PodSettings) -> Service {
        let key = sup.uploader_service();
        Service {
            metadata: ObjectMeta {
                name: Some(key.name.clone()),
                namespace: key.namespace.clone(),
                owner_references: Some(vec![settings.owner_reference.clone()]),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(BTreeMap::from([(LABEL_UPLOADER_SERVICE.to_string(), key.name)])),
                ports: Some(vec![ServicePort {
                    name: Some("uploader".to_string()),
                    port: SERVICE_PORT,
                    target_port: Some(IntOrString::Int(UPLOADER_PORT)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn make_ingress(&self, sup: &Supplements, settings: &PodSettings) -> Ingress {
        let key = sup.uploader_ingress();
        let path = upload_path(sup);
        let url = format!("https://{}{}", self.ingress.host, path);

        Ingress {
            metadata: ObjectMeta {
                name: Some(key.name.clone()),
                namespace: key.namespace.clone(),
                owner_references: Some(vec![settings.owner_reference.clone()]),
                annotations: Some(BTreeMap::from([(ANN_UPLOAD_URL.to_string(), url)])),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                ingress_class_name: self.ingress.class.clone(),
                tls: self.ingress.tls_secret.as_ref().map(|secret| {
                    vec![IngressTLS {
                        hosts: Some(vec![self.ingress.host.clone()]),
                        secret_name: Some(secret.clone()),
                    }]
                }),
                rules: Some(vec![IngressRule {
                    host: Some(self.ingress.host.clone()),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some(path),
                            path_type: "Exact".to_string(),
                            backend: IngressBackend {
                                service: Some(IngressServiceBackend {
                                    name: sup.uploader_service().name,
                                    port: Some(ServiceBackendPort {
                                        number: Some(SERVICE_PORT),
                                        ..Default::default()
                                    }),
                                }),
                                ..Default::default()
                            },
                        }],
                    }),
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    /// Returns the uploader Pod.
    pub async fn get_pod(&self, sup: &Supplements) -> Result<Option<Pod>, ServiceError> {
        Ok(self.store.get_by_key(&sup.uploader_pod()).await?)
    }

    /// Returns the uploader Service.
    pub async fn get_service(&self, sup: &Supplements) -> Result<Option<Service>, ServiceError> {
        Ok(self.store.get_by_key(&sup.uploader_service()).await?)
    }

    /// Returns the uploader Ingress.
    pub async fn get_ingress(&self, sup: &Supplements) -> Result<Option<Ingress>, ServiceError> {
        Ok(self.store.get_by_key(&sup.uploader_ingress()).await?)
    }

    /// Keeps the Pod from being deleted while its result is needed.
    pub async fn protect(&self, pod: &Pod) -> Result<(), ServiceError> {
        Ok(self.protection.protect(pod).await?)
    }

    /// Releases the Pod.
    pub async fn unprotect(&self, pod: &Pod) -> Result<(), ServiceError> {
        Ok(self.protection.unprotect(pod).await?)
    }

    /// Deletes the Pod, Service, Ingress and supplements; returns true if anything existed.
    pub async fn clean_up(&self, sup: &Supplements) -> Result<bool, ServiceError> {
        let mut found = delete_supplements(&self.store, sup).await?;
        if let Some(pod) = self.get_pod(sup).await? {
            debug!("Deleting uploader Pod {}", sup.uploader_pod());
            self.protection.unprotect(&pod).await?;
            self.store.delete_object(&pod).await?;
            found = true;
        }
        if let Some(service) = self.get_service(sup).await? {
            self.store.delete_object(&service).await?;
            found = true;
        }
        if let Some(ingress) = self.get_ingress(sup).await? {
            self.store.delete_object(&ingress).await?;
            found = true;
        }
        Ok(found)
    }
}

/// External upload URL published on the Ingress.
pub fn external_url(ingress: &Ingress) -> Option<&str> {
    meta::annotation(ingress, ANN_UPLOAD_URL).filter(|url| !url.is_empty())
}

/// Command a user runs to upload a file.
pub fn upload_command(url: &str) -> String {
    format!("curl {url} -T example.iso")
}

/// Returns true when the user can start uploading.
pub fn is_uploader_ready(pod: Option<&Pod>, service: Option<&Service>, ingress: Option<&Ingress>) -> bool {
    let running = pod.is_some_and(super::stat::is_pod_running);
    running && service.is_some() && ingress.and_then(external_url).is_some()
}
