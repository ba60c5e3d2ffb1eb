//! Virtualization Controller
//!
//! Reconciles the virtualization CRDs:
//! - ClusterVirtualImage, VirtualImage, VirtualDisk: provisioning from data sources through DVCR
//! - VirtualMachine: KubeVirt VM generation, change approval and lifecycle
//! - VirtualMachineBlockDeviceAttachment: disk hotplug into running VMs
//! - VirtualMachineIPAddressClaim and VirtualMachineIPAddressLease: IPAM

mod backoff;
mod context;
mod controller;
mod error;
mod handler;
mod index;
mod meta;
mod provisionable;
mod provisioning;
mod reconciler;
mod service;
mod source;
mod store;
#[cfg(test)]
mod test_utils;
mod vm;
mod vmbda;
mod vmchange;
mod vmip;
mod watcher;

use std::env;
use std::sync::Arc;

use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::Secret;
use kube::Client;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dvcr_client::{DvcrClient, DvcrSettings, parse_docker_config};

use crate::context::{Context, ControllerSettings};
use crate::controller::Controller;
use crate::error::ControllerError;
use crate::index::BlockDeviceIndex;
use crate::service::recorder::KubeEventRecorder;
use crate::service::uploader::UploaderIngressSettings;
use crate::store::Store;
use crate::store::cluster::ClusterStore;

const CONTROLLER_NAME: &str = "virtualization-controller";
const DEFAULT_CONTROLLER_NAMESPACE: &str = "d8-virtualization";
const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";
const CA_KEY: &str = "ca.crt";

fn required(name: &str) -> Result<String, ControllerError> {
    env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ControllerError::InvalidConfig(format!("{name} environment variable is required")))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn dvcr_settings() -> Result<DvcrSettings, ControllerError> {
    let mut settings = DvcrSettings::new(required("DVCR_REGISTRY_URL")?);
    settings.auth_secret = optional("DVCR_AUTH_SECRET");
    settings.auth_secret_namespace = optional("DVCR_AUTH_SECRET_NAMESPACE");
    settings.certs_secret = optional("DVCR_CERTS_SECRET");
    settings.certs_secret_namespace = optional("DVCR_CERTS_SECRET_NAMESPACE");
    settings.insecure_tls = optional("DVCR_INSECURE_TLS").is_some_and(|v| v.eq_ignore_ascii_case("true"));
    Ok(settings)
}

fn parse_cidrs(value: &str) -> Result<Vec<Ipv4Net>, ControllerError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Ipv4Net>()
                .map_err(|e| ControllerError::InvalidConfig(format!("invalid CIDR {s:?} in VIRTUAL_MACHINE_CIDRS: {e}")))
        })
        .collect()
}

fn controller_settings() -> Result<ControllerSettings, ControllerError> {
    let vm_cidrs = parse_cidrs(&required("VIRTUAL_MACHINE_CIDRS")?)?;
    if vm_cidrs.is_empty() {
        return Err(ControllerError::InvalidConfig(
            "VIRTUAL_MACHINE_CIDRS must list at least one CIDR".to_string(),
        ));
    }
    Ok(ControllerSettings {
        controller_namespace: optional("CONTROLLER_NAMESPACE")
            .unwrap_or_else(|| DEFAULT_CONTROLLER_NAMESPACE.to_string()),
        importer_image: required("IMPORTER_IMAGE")?,
        uploader_image: required("UPLOADER_IMAGE")?,
        ingress: Arc::new(UploaderIngressSettings {
            host: required("UPLOADER_INGRESS_HOST")?,
            tls_secret: optional("UPLOADER_INGRESS_TLS_SECRET"),
            class: optional("UPLOADER_INGRESS_CLASS"),
        }),
        vm_cidrs: Arc::new(vm_cidrs),
    })
}

/// Reads one key of a Secret; a missing Secret is logged and skipped.
async fn secret_key(
    store: &Store,
    name: Option<&str>,
    namespace: Option<&str>,
    key: &str,
) -> Result<Option<Vec<u8>>, ControllerError> {
    let (Some(name), Some(namespace)) = (name, namespace) else {
        return Ok(None);
    };
    let secret: Option<Secret> = store.get(Some(namespace), name).await?;
    let Some(secret) = secret else {
        warn!("DVCR secret {}/{} not found", namespace, name);
        return Ok(None);
    };
    Ok(secret.data.and_then(|mut data| data.remove(key)).map(|bytes| bytes.0))
}

async fn dvcr_client(store: &Store, settings: &DvcrSettings) -> Result<DvcrClient, ControllerError> {
    let auth = secret_key(
        store,
        settings.auth_secret.as_deref(),
        settings.auth_secret_namespace.as_deref(),
        DOCKER_CONFIG_KEY,
    )
    .await?;
    let credentials = match auth {
        Some(config) => parse_docker_config(&config, &settings.registry_url)?,
        None => None,
    };
    let ca = secret_key(
        store,
        settings.certs_secret.as_deref(),
        settings.certs_secret_namespace.as_deref(),
        CA_KEY,
    )
    .await?;
    Ok(DvcrClient::new(settings, credentials, ca.as_deref())?)
}

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Virtualization Controller");

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider is already installed");
    }

    let dvcr = dvcr_settings()?;
    let settings = controller_settings()?;
    let namespace = optional("WATCH_NAMESPACE");

    info!("Configuration:");
    info!("  DVCR: {}", dvcr.registry_url);
    info!("  Controller namespace: {}", settings.controller_namespace);
    info!("  VM CIDRs: {:?}", settings.vm_cidrs);
    info!("  Namespace: {}", namespace.as_deref().unwrap_or("all namespaces"));

    let client = Client::try_default().await?;
    let store = Store::new(Arc::new(ClusterStore::new(client.clone())));
    let checker = dvcr_client(&store, &dvcr).await?;

    let ctx = Arc::new(Context {
        store,
        dvcr: Arc::new(dvcr),
        settings: Arc::new(settings),
        checker: Arc::new(checker),
        recorder: Arc::new(KubeEventRecorder::new(client.clone(), CONTROLLER_NAME)),
        index: BlockDeviceIndex::new(),
    });

    let controller = Controller::new(client, ctx, namespace).await?;
    controller.run().await?;

    Ok(())
}
