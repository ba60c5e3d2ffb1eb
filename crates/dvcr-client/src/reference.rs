//! Image reference parsing
//!
//! Splits `host[:port]/repository[:tag|@digest]` into the parts needed to
//! address the registry v2 API.

use crate::error::DvcrError;

const DEFAULT_TAG: &str = "latest";

/// Parsed image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host with an optional port
    pub host: String,
    /// Repository path
    pub repository: String,
    /// Tag or digest
    pub reference: String,
}

impl ImageReference {
    /// Parses an image reference. A `docker://` prefix is accepted.
    pub fn parse(image: &str) -> Result<Self, DvcrError> {
        let image = image.trim().trim_start_matches("docker://");

        let (host, rest) = image
            .split_once('/')
            .ok_or_else(|| DvcrError::InvalidReference(format!("{image}: missing repository")))?;
        if host.is_empty() || rest.is_empty() {
            return Err(DvcrError::InvalidReference(format!("{image}: empty host or repository")));
        }

        let (repository, reference) = if let Some((repo, digest)) = rest.split_once('@') {
            (repo, digest)
        } else {
            match rest.rsplit_once(':') {
                // A colon after the last slash separates the tag.
                Some((repo, tag)) if !tag.contains('/') => (repo, tag),
                _ => (rest, DEFAULT_TAG),
            }
        };

        if repository.is_empty() || reference.is_empty() {
            return Err(DvcrError::InvalidReference(format!("{image}: empty repository or tag")));
        }

        Ok(Self {
            host: host.to_string(),
            repository: repository.to_string(),
            reference: reference.to_string(),
        })
    }

    /// URL of the manifest in the registry v2 API.
    #[must_use]
    pub fn manifest_url(&self, scheme: &str) -> String {
        format!("{scheme}://{}/v2/{}/manifests/{}", self.host, self.repository, self.reference)
    }
}
