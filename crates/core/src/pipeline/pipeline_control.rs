use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::announcement::domain::announcement_policy::AnnouncementPolicy;
use crate::shared::config::AlertConfig;
use crate::shared::constants::VIDEO_EXTENSIONS;
use crate::video::domain::capture_backend::{CaptureBackend, SourceDescriptor};

use super::video_source_controller::SourceSelector;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("camera {index} is not available (available: {available:?})")]
    DeviceUnavailable { index: u32, available: Vec<u32> },
    #[error("video file not found: {}", .0.display())]
    FileNotFound(PathBuf),
    #[error("unsupported video format: {} (expected one of {})", .path.display(), VIDEO_EXTENSIONS.join(", "))]
    UnsupportedFormat { path: PathBuf },
}

/// Serializable view of the running configuration.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConfigSnapshot {
    pub announcement_policy: AnnouncementPolicy,
    pub cooldown_secs: f64,
    pub confidence_threshold: f64,
    pub inference_interval_secs: f64,
    pub repeat_count: u32,
    pub repeat_gap_secs: f64,
    pub detection_enabled: bool,
    pub source: SourceDescriptor,
}

/// Control surface for a running pipeline.
///
/// Holds clones of the shared selector and detection flag, so it can be
/// moved to another thread while the pipeline loop runs.
pub struct PipelineControl {
    selector: SourceSelector,
    detection_enabled: Arc<AtomicBool>,
    backend: Arc<dyn CaptureBackend>,
    config: AlertConfig,
}

impl PipelineControl {
    pub fn new(
        selector: SourceSelector,
        detection_enabled: Arc<AtomicBool>,
        backend: Arc<dyn CaptureBackend>,
        config: AlertConfig,
    ) -> Self {
        Self {
            selector,
            detection_enabled,
            backend,
            config,
        }
    }

    /// Camera indices below `camera_probe_max` that deliver frames.
    ///
    /// Probing opens each device, so it briefly competes with the pipeline
    /// for the active camera.
    pub fn available_devices(&self) -> Vec<u32> {
        self.backend.probe_devices(self.config.camera_probe_max)
    }

    pub fn switch_to_device(&self, index: u32) -> Result<(), ControlError> {
        if self.selector.current() == SourceDescriptor::Device(index) {
            log::debug!("Camera {index} already active");
            return Ok(());
        }
        let available = self.available_devices();
        if !available.contains(&index) {
            return Err(ControlError::DeviceUnavailable { index, available });
        }
        log::info!("Switching to camera {index}");
        self.selector.select(SourceDescriptor::Device(index));
        Ok(())
    }

    pub fn switch_to_file(&self, path: &Path) -> Result<(), ControlError> {
        if !path.is_file() {
            return Err(ControlError::FileNotFound(path.to_path_buf()));
        }
        if !is_supported_video(path) {
            return Err(ControlError::UnsupportedFormat {
                path: path.to_path_buf(),
            });
        }
        log::info!("Switching to video file {}", path.display());
        self.selector.select(SourceDescriptor::File(path.to_path_buf()));
        Ok(())
    }

    /// Returns to the most recently used camera.
    pub fn switch_to_camera(&self) -> Result<(), ControlError> {
        self.switch_to_device(self.selector.resume_device())
    }

    pub fn set_detection_enabled(&self, enabled: bool) {
        log::info!("Detection {}", if enabled { "enabled" } else { "disabled" });
        self.detection_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn detection_enabled(&self) -> bool {
        self.detection_enabled.load(Ordering::SeqCst)
    }

    pub fn current_source(&self) -> SourceDescriptor {
        self.selector.current()
    }

    pub fn config_snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            announcement_policy: self.config.announcement_policy.clone(),
            cooldown_secs: self.config.cooldown_secs,
            confidence_threshold: self.config.confidence_threshold,
            inference_interval_secs: self.config.inference_interval_secs,
            repeat_count: self.config.repeat_count,
            repeat_gap_secs: self.config.repeat_gap_secs,
            detection_enabled: self.detection_enabled(),
            source: self.current_source(),
        }
    }
}

fn is_supported_video(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            VIDEO_EXTENSIONS
                .iter()
                .any(|supported| supported.eq_ignore_ascii_case(ext))
        })
}
