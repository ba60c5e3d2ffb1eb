//! Statistics of importer and uploader Pods.
//!
//! A running Pod reports progress and speed through annotations. When it
//! terminates it writes a JSON final report into its termination message:
//!
//! ```json
//! {"storedSizeBytes": 1024, "unpackedSizeBytes": 4096, "format": "qcow2",
//!  "averageSpeed": 2048, "errorMessage": ""}
//! ```

use k8s_openapi::api::core::v1::Pod;
use serde::Deserialize;
use thiserror::Error;

use crds::annotations::{ANN_IMPORT_AVG_SPEED, ANN_IMPORT_CUR_SPEED, ANN_IMPORT_PROGRESS};
use crds::{ImageStatusSize, StatusSpeed};

use super::ServiceError;
use super::importer::{IMPORTER_CONTAINER, IMPORTER_DESTINATION_ENDPOINT};
use super::uploader::{UPLOADER_CONTAINER, UPLOADER_DESTINATION_ENDPOINT};
use crate::meta;

/// Report written by the importer or uploader on exit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalReport {
    /// Bytes stored in the registry
    #[serde(default)]
    pub stored_size_bytes: u64,
    /// Bytes of the unpacked image
    #[serde(default)]
    pub unpacked_size_bytes: u64,
    /// Detected image format
    #[serde(default)]
    pub format: String,
    /// Average transfer speed in bytes per second
    #[serde(default)]
    pub average_speed: u64,
    /// Set when provisioning failed
    #[serde(default)]
    pub error_message: String,
}

/// Why a provisioning Pod is not making progress.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PodCheckError {
    /// Init containers have not finished
    #[error("{0}")]
    NotInitialized(String),
    /// Pod waits for a node
    #[error("{0}")]
    NotScheduled(String),
    /// Importer or uploader reported a failure
    #[error("{0}")]
    ProvisioningFailed(String),
}

/// Range the Pod progress is mapped onto, in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressScale {
    /// Progress reported at 0%
    pub low: f64,
    /// Progress reported at 100%
    pub high: f64,
}

impl ProgressScale {
    /// Progress as reported.
    pub const FULL: Self = Self { low: 0.0, high: 100.0 };

    /// Maps a reported percentage onto the range.
    pub fn apply(self, percent: f64) -> f64 {
        self.low + percent.clamp(0.0, 100.0) * (self.high - self.low) / 100.0
    }
}

fn pod_name(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}

fn phase(pod: &Pod) -> &str {
    pod.status.as_ref().and_then(|s| s.phase.as_deref()).unwrap_or_default()
}

fn termination_message(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .filter_map(|cs| cs.state.as_ref()?.terminated.as_ref()?.message.as_deref())
        .find(|m| !m.trim().is_empty())
}

/// Returns true once the Pod finished successfully.
pub fn is_pod_complete(pod: &Pod) -> bool {
    phase(pod) == "Succeeded"
}

/// Returns true while the Pod runs.
pub fn is_pod_running(pod: &Pod) -> bool {
    phase(pod) == "Running"
}

/// Returns true when the Pod is being deleted.
pub fn is_pod_terminating(pod: &Pod) -> bool {
    meta::is_deleting(pod)
}

/// Decodes the final report, `None` while the Pod has not written one.
pub fn final_report(pod: &Pod) -> Result<Option<FinalReport>, ServiceError> {
    termination_message(pod)
        .map(serde_json::from_str)
        .transpose()
        .map_err(ServiceError::from)
}

/// Checks that the Pod can make progress and has not reported a failure.
pub fn check_pod(pod: &Pod) -> Result<(), PodCheckError> {
    let name = pod_name(pod);
    let conditions = pod.status.as_ref().and_then(|s| s.conditions.as_deref()).unwrap_or_default();

    for condition in conditions.iter().filter(|c| c.status == "False") {
        let message = condition.message.as_deref().unwrap_or_default();
        match condition.type_.as_str() {
            "Initialized" => {
                return Err(PodCheckError::NotInitialized(format!(
                    "provisioning Pod {name} is not initialized: {message}"
                )));
            }
            "PodScheduled" => {
                return Err(PodCheckError::NotScheduled(format!(
                    "provisioning Pod {name} is not scheduled: {message}"
                )));
            }
            _ => {}
        }
    }

    if let Some(message) = termination_message(pod) {
        let error = match serde_json::from_str::<FinalReport>(message) {
            Ok(report) => report.error_message,
            Err(_) => message.to_string(),
        };
        if !error.is_empty() {
            return Err(PodCheckError::ProvisioningFailed(format!(
                "provisioning failed: Pod {name} termination message: {error}"
            )));
        }
    }

    if phase(pod) == "Failed" {
        return Err(PodCheckError::ProvisioningFailed(format!("provisioning failed: Pod {name} failed")));
    }

    Ok(())
}

/// Image format from the final report.
pub fn get_format(pod: &Pod) -> Result<String, ServiceError> {
    Ok(final_report(pod)?.map(|r| r.format).unwrap_or_default())
}

/// Returns true when the final report describes an ISO image.
pub fn get_cdrom(pod: &Pod) -> Result<bool, ServiceError> {
    Ok(get_format(pod)? == "iso")
}

/// Stored and unpacked sizes from the final report.
pub fn get_size(pod: &Pod) -> Result<ImageStatusSize, ServiceError> {
    let Some(report) = final_report(pod)? else {
        return Ok(ImageStatusSize::default());
    };
    Ok(ImageStatusSize {
        stored: humanize_ibytes(report.stored_size_bytes),
        stored_bytes: report.stored_size_bytes.to_string(),
        unpacked: humanize_ibytes(report.unpacked_size_bytes),
        unpacked_bytes: report.unpacked_size_bytes.to_string(),
    })
}

fn speed_annotation(pod: &Pod, key: &str) -> Option<u64> {
    meta::annotation(pod, key)?.trim().parse().ok()
}

/// Transfer speed from the final report, otherwise from the Pod annotations.
pub fn get_download_speed(pod: &Pod) -> Option<StatusSpeed> {
    if let Ok(Some(report)) = final_report(pod) {
        return Some(StatusSpeed {
            avg: format!("{}/s", humanize_ibytes(report.average_speed)),
            avg_bytes: report.average_speed.to_string(),
            ..Default::default()
        });
    }

    let avg = speed_annotation(pod, ANN_IMPORT_AVG_SPEED);
    let current = speed_annotation(pod, ANN_IMPORT_CUR_SPEED);
    if avg.is_none() && current.is_none() {
        return None;
    }
    Some(StatusSpeed {
        avg: avg.map(|b| format!("{}/s", humanize_ibytes(b))).unwrap_or_default(),
        avg_bytes: avg.map(|b| b.to_string()).unwrap_or_default(),
        current: current.map(|b| format!("{}/s", humanize_ibytes(b))).unwrap_or_default(),
        current_bytes: current.map(|b| b.to_string()).unwrap_or_default(),
    })
}

fn reported_progress(pod: &Pod) -> Option<f64> {
    meta::annotation(pod, ANN_IMPORT_PROGRESS)?
        .trim()
        .trim_end_matches('%')
        .parse()
        .ok()
}

fn format_progress(percent: f64) -> String {
    format!("{percent:.1}%")
}

/// Progress of the Pod mapped onto `scale`; `previous` while nothing is reported.
pub fn get_progress(pod: &Pod, previous: &str, scale: ProgressScale) -> String {
    if is_pod_complete(pod) && check_pod(pod).is_ok() {
        if scale == ProgressScale::FULL {
            return "100%".to_string();
        }
        return format_progress(scale.high);
    }

    match reported_progress(pod) {
        Some(percent) => format_progress(scale.apply(percent)),
        None => previous.to_string(),
    }
}

/// Returns true once the importer reported any progress.
pub fn is_import_started(pod: &Pod) -> bool {
    reported_progress(pod).is_some_and(|p| p > 0.0)
}

/// Returns true once the user started uploading.
pub fn is_upload_started(pod: &Pod) -> bool {
    is_pod_complete(pod) || is_import_started(pod)
}

/// Image the importer or uploader writes into DVCR.
pub fn get_dvcr_image_name(pod: &Pod) -> String {
    let Some(spec) = pod.spec.as_ref() else {
        return String::new();
    };
    spec.containers
        .iter()
        .filter_map(|c| {
            let var = match c.name.as_str() {
                IMPORTER_CONTAINER => IMPORTER_DESTINATION_ENDPOINT,
                UPLOADER_CONTAINER => UPLOADER_DESTINATION_ENDPOINT,
                _ => return None,
            };
            c.env.as_ref()?.iter().find(|e| e.name == var)?.value.clone()
        })
        .next()
        .unwrap_or_default()
}

/// Formats a byte count with binary units, e.g. `1.5 GiB`.
pub fn humanize_ibytes(bytes: u64) -> String {
    const UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if value < 10.0 {
        format!("{value:.1} {}", UNITS[unit])
    } else {
        format!("{value:.0} {}", UNITS[unit])
    }
}
