//! ImageChecker trait for mocking
//!
//! The concrete `DvcrClient` implements this trait; tests use `MockImageChecker`.

use crate::error::DvcrError;

/// Checks image presence in a registry
#[async_trait::async_trait]
pub trait ImageCheckerTrait: Send + Sync {
    /// Returns `Ok(true)` when the image manifest exists, `Ok(false)` when the
    /// registry reports it missing.
    async fn check_image_exists(&self, image: &str) -> Result<bool, DvcrError>;
}
