//! DVCR registry client
//!
//! Checks image presence through the registry v2 API: `HEAD` on the image
//! manifest, `200` means present and `404` means missing.

use std::time::Duration;

use reqwest::{Certificate, Client, StatusCode};
use tracing::debug;

use crate::checker_trait::ImageCheckerTrait;
use crate::credentials::BasicAuth;
use crate::error::DvcrError;
use crate::reference::ImageReference;
use crate::settings::DvcrSettings;

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.v2+json, \
    application/vnd.oci.image.index.v1+json";

/// DVCR registry client
pub struct DvcrClient {
    client: Client,
    credentials: Option<BasicAuth>,
}

impl std::fmt::Debug for DvcrClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DvcrClient")
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl DvcrClient {
    /// Create a new DVCR client
    ///
    /// # Arguments
    /// * `settings` - registry settings; `insecure_tls` disables certificate checks
    /// * `credentials` - basic-auth credentials from the auth Secret
    /// * `ca_pem` - PEM-encoded registry CA from the certs Secret
    pub fn new(
        settings: &DvcrSettings,
        credentials: Option<BasicAuth>,
        ca_pem: Option<&[u8]>,
    ) -> Result<Self, DvcrError> {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(settings.insecure_tls);

        if let Some(pem) = ca_pem {
            builder = builder.add_root_certificate(Certificate::from_pem(pem)?);
        }

        Ok(Self {
            client: builder.build()?,
            credentials,
        })
    }
}

#[async_trait::async_trait]
impl ImageCheckerTrait for DvcrClient {
    async fn check_image_exists(&self, image: &str) -> Result<bool, DvcrError> {
        let reference = ImageReference::parse(image)?;
        let url = reference.manifest_url("https");
        debug!("Checking image manifest: {}", url);

        let mut request = self.client.head(&url).header("Accept", MANIFEST_ACCEPT);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(DvcrError::Authentication(format!(
                "{} for {}",
                response.status(),
                image
            ))),
            status => Err(DvcrError::Registry(format!(
                "unexpected status {status} for {image}"
            ))),
        }
    }
}
