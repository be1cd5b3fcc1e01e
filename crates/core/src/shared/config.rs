use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::announcement::domain::announcement_policy::AnnouncementPolicy;
use crate::shared::constants::YOLO_MODEL_NAME;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Runtime configuration consumed by the alerting core.
///
/// Durations are stored as fractional seconds so the JSON file stays
/// hand-editable; use the accessor methods to get [`Duration`]s. Missing
/// keys fall back to [`AlertConfig::default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub inference_interval_secs: f64,
    pub confidence_threshold: f64,
    pub cooldown_secs: f64,
    pub announcement_policy: AnnouncementPolicy,
    pub repeat_count: u32,
    pub repeat_gap_secs: f64,
    pub backlog_threshold: usize,
    pub frame_delay_secs: f64,
    pub source_retry_delay_secs: f64,
    pub warmup_delay_secs: f64,
    pub worker_start_timeout_secs: f64,
    pub worker_poll_interval_secs: f64,
    pub degraded_failure_threshold: u32,
    pub camera_index: u32,
    pub camera_probe_max: u32,
    pub speech_program: String,
    pub speech_args: Vec<String>,
    /// Words per minute passed to the speech program.
    pub speech_rate: u32,
    /// 0.0 (silent) to 2.0 (double); 1.0 is the program's default loudness.
    pub speech_volume: f64,
    pub model_name: String,
    pub model_path: Option<PathBuf>,
    pub model_url: Option<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            inference_interval_secs: 1.0,
            confidence_threshold: 0.5,
            cooldown_secs: 5.0,
            announcement_policy: AnnouncementPolicy::AllClasses,
            repeat_count: 1,
            repeat_gap_secs: 0.3,
            backlog_threshold: 5,
            frame_delay_secs: 0.03,
            source_retry_delay_secs: 1.0,
            warmup_delay_secs: 0.2,
            worker_start_timeout_secs: 2.0,
            worker_poll_interval_secs: 0.5,
            degraded_failure_threshold: 3,
            camera_index: 0,
            camera_probe_max: 5,
            speech_program: "espeak-ng".to_string(),
            speech_args: Vec::new(),
            speech_rate: 150,
            speech_volume: 1.0,
            model_name: YOLO_MODEL_NAME.to_string(),
            model_path: None,
            model_url: None,
        }
    }
}

impl AlertConfig {
    /// Platform config location, e.g. `~/.config/Callout/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("Callout").join("config.json"))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&json).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if given, else the platform config file if it exists,
    /// else the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |e| ConfigError::Write {
            path: path.to_path_buf(),
            source: e,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        fs::write(path, json).map_err(write_err)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("inference_interval_secs", self.inference_interval_secs),
            ("cooldown_secs", self.cooldown_secs),
            ("repeat_gap_secs", self.repeat_gap_secs),
            ("frame_delay_secs", self.frame_delay_secs),
            ("source_retry_delay_secs", self.source_retry_delay_secs),
            ("warmup_delay_secs", self.warmup_delay_secs),
            ("worker_start_timeout_secs", self.worker_start_timeout_secs),
            ("worker_poll_interval_secs", self.worker_poll_interval_secs),
        ];
        for (name, value) in durations {
            if Duration::try_from_secs_f64(value).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a non-negative number of seconds within range, got {value}"
                )));
            }
        }
        if self.worker_poll_interval().is_zero() {
            return Err(ConfigError::Invalid(
                "worker_poll_interval_secs must be greater than zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "confidence_threshold must be between 0.0 and 1.0, got {}",
                self.confidence_threshold
            )));
        }
        if self.repeat_count == 0 {
            return Err(ConfigError::Invalid("repeat_count must be at least 1".into()));
        }
        if self.backlog_threshold == 0 {
            return Err(ConfigError::Invalid(
                "backlog_threshold must be at least 1".into(),
            ));
        }
        if self.degraded_failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "degraded_failure_threshold must be at least 1".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.speech_volume) {
            return Err(ConfigError::Invalid(format!(
                "speech_volume must be between 0.0 and 2.0, got {}",
                self.speech_volume
            )));
        }
        if self.speech_program.trim().is_empty() {
            return Err(ConfigError::Invalid("speech_program must not be empty".into()));
        }
        if let AnnouncementPolicy::AllowList { classes } = &self.announcement_policy {
            if classes.is_empty() {
                return Err(ConfigError::Invalid(
                    "allow_list announcement policy needs at least one class".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn inference_interval(&self) -> Duration {
        secs(self.inference_interval_secs)
    }

    pub fn cooldown(&self) -> Duration {
        secs(self.cooldown_secs)
    }

    pub fn repeat_gap(&self) -> Duration {
        secs(self.repeat_gap_secs)
    }

    pub fn frame_delay(&self) -> Duration {
        secs(self.frame_delay_secs)
    }

    pub fn source_retry_delay(&self) -> Duration {
        secs(self.source_retry_delay_secs)
    }

    pub fn warmup_delay(&self) -> Duration {
        secs(self.warmup_delay_secs)
    }

    pub fn worker_start_timeout(&self) -> Duration {
        secs(self.worker_start_timeout_secs)
    }

    pub fn worker_poll_interval(&self) -> Duration {
        secs(self.worker_poll_interval_secs)
    }
}

/// Out-of-range values saturate; `validate` rejects them before use.
fn secs(value: f64) -> Duration {
    if value <= 0.0 || value.is_nan() {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}
