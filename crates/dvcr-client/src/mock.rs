//! Mock image checker for unit testing
//!
//! Stores image presence in memory and counts calls so tests can assert the
//! checker was not consulted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::checker_trait::ImageCheckerTrait;
use crate::error::DvcrError;

/// Mock image checker
#[derive(Debug, Clone, Default)]
pub struct MockImageChecker {
    images: Arc<Mutex<HashMap<String, bool>>>,
    failure: Arc<Mutex<Option<String>>>,
    calls: Arc<Mutex<usize>>,
}

impl MockImageChecker {
    /// Create a mock that reports every image as missing
    pub fn new() -> Self {
        Self::default()
    }

    /// Record whether an image exists
    pub fn set_image(&self, image: impl Into<String>, exists: bool) {
        self.images.lock().unwrap().insert(image.into(), exists);
    }

    /// Make every check fail with a registry error
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.failure.lock().unwrap() = Some(message.into());
    }

    /// Number of checks performed
    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl ImageCheckerTrait for MockImageChecker {
    async fn check_image_exists(&self, image: &str) -> Result<bool, DvcrError> {
        *self.calls.lock().unwrap() += 1;

        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(DvcrError::Registry(message));
        }

        Ok(self.images.lock().unwrap().get(image).copied().unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_reports_configured_images() {
        let checker = MockImageChecker::new();
        checker.set_image("dvcr/cvi/ubuntu:latest", true);

        assert!(checker.check_image_exists("dvcr/cvi/ubuntu:latest").await.unwrap());
        assert!(!checker.check_image_exists("dvcr/cvi/other:latest").await.unwrap());
        assert_eq!(checker.calls(), 2);
    }

    #[tokio::test]
    async fn test_mock_failure() {
        let checker = MockImageChecker::new();
        checker.fail_with("connection refused");

        assert!(checker.check_image_exists("dvcr/cvi/ubuntu:latest").await.is_err());
    }
}
