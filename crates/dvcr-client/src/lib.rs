//! DVCR Client
//!
//! Settings of the internal disk-image registry (DVCR) and a client that
//! checks whether an image is still present in it.
//!
//! # Example
//!
//! ```no_run
//! use dvcr_client::{DvcrClient, DvcrSettings, ImageCheckerTrait};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = DvcrSettings::new("dvcr.d8-virtualization.svc");
//! let client = DvcrClient::new(&settings, None, None)?;
//!
//! let image = settings.registry_image_for_cvi("ubuntu");
//! let exists = client.check_image_exists(&image).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod credentials;
pub mod error;
pub mod reference;
pub mod settings;
#[path = "trait.rs"]
pub mod checker_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use checker_trait::ImageCheckerTrait;
pub use client::DvcrClient;
pub use credentials::{BasicAuth, parse_docker_config};
pub use error::DvcrError;
pub use reference::ImageReference;
pub use settings::DvcrSettings;
#[cfg(feature = "test-util")]
pub use mock::MockImageChecker;
