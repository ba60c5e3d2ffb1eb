//! Registry credentials
//!
//! Parses the `.dockerconfigjson` payload of an auth Secret into basic-auth
//! credentials for one registry host.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;

use crate::error::DvcrError;

/// Basic-auth credentials
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    /// User name
    pub username: String,
    /// Password
    pub password: String,
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    auth: Option<String>,
}

/// Extracts credentials for `host` from a docker config JSON.
///
/// Entries are matched by host with any scheme or path stripped. Returns
/// `Ok(None)` when the config has no entry for the host.
pub fn parse_docker_config(config: &[u8], host: &str) -> Result<Option<BasicAuth>, DvcrError> {
    let config: DockerConfig = serde_json::from_slice(config)?;

    let entry = config.auths.iter().find_map(|(key, entry)| {
        (normalize_host(key) == normalize_host(host)).then_some(entry)
    });
    let Some(entry) = entry else {
        return Ok(None);
    };

    if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
        return Ok(Some(BasicAuth {
            username: username.clone(),
            password: password.clone(),
        }));
    }

    let auth = entry
        .auth
        .as_deref()
        .ok_or_else(|| DvcrError::InvalidCredentials(format!("no credentials for {host}")))?;
    let decoded = STANDARD
        .decode(auth)
        .map_err(|e| DvcrError::InvalidCredentials(format!("auth for {host} is not base64: {e}")))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|e| DvcrError::InvalidCredentials(format!("auth for {host} is not UTF-8: {e}")))?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| DvcrError::InvalidCredentials(format!("auth for {host} has no user:password")))?;

    Ok(Some(BasicAuth {
        username: username.to_string(),
        password: password.to_string(),
    }))
}

fn normalize_host(value: &str) -> &str {
    let value = value
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    value.split('/').next().unwrap_or(value)
}
