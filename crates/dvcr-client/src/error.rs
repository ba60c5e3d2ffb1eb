//! DVCR client errors

use thiserror::Error;

/// Errors that can occur when talking to DVCR
#[derive(Debug, Error)]
pub enum DvcrError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Registry returned an unexpected status
    #[error("Registry error: {0}")]
    Registry(String),

    /// Registry rejected the credentials
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Image reference cannot be parsed
    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    /// Credentials Secret cannot be parsed
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
