use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::announcement::domain::announcement_job::AnnouncementJob;
use crate::announcement::domain::announcement_policy::AnnouncementPolicy;
use crate::announcement::domain::announcement_sink::AnnouncementSink;
use crate::announcement::domain::cooldown_engine::CooldownEngine;
use crate::detection::domain::object_detector::ObjectDetector;
use crate::pipeline::overlay::draw_detections;
use crate::shared::config::AlertConfig;
use crate::shared::detection::Detection;
use crate::shared::frame::Frame;

/// Mutable state carried between frames.
#[derive(Clone, Debug, Default)]
pub struct PipelineState {
    /// When the cadence started: the first frame processed with detection
    /// enabled. The first inference is due one interval later.
    pub started_at: Option<Instant>,
    pub last_inference: Option<Instant>,
    /// Detections from the latest successful inference, already filtered by
    /// confidence. Replaced wholesale, never merged.
    pub detections: Vec<Detection>,
}

impl PipelineState {
    pub fn inference_due(&self, now: Instant, interval: Duration) -> bool {
        match self.last_inference.or(self.started_at) {
            None => true,
            Some(reference) => now.saturating_duration_since(reference) >= interval,
        }
    }
}

/// What happened while processing one frame.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CycleReport {
    pub inference_ran: bool,
    pub inference_duration: Option<Duration>,
    pub detector_failed: bool,
    /// Detections drawn on this frame.
    pub detection_count: usize,
    /// Classes whose announcement was accepted by the sink, sorted.
    pub announced: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct CadenceSettings {
    pub inference_interval: Duration,
    pub confidence_threshold: f64,
    pub policy: AnnouncementPolicy,
    pub repeat: u32,
    pub repeat_gap: Duration,
}

impl From<&AlertConfig> for CadenceSettings {
    fn from(config: &AlertConfig) -> Self {
        Self {
            inference_interval: config.inference_interval(),
            confidence_threshold: config.confidence_threshold,
            policy: config.announcement_policy.clone(),
            repeat: config.repeat_count,
            repeat_gap: config.repeat_gap(),
        }
    }
}

/// Runs the detector at most once per `inference_interval`, keeps the last
/// detections drawn on every frame, and turns newly seen classes into
/// announcement jobs gated by the cooldown engine.
pub struct DetectionCadenceController {
    detector: Box<dyn ObjectDetector>,
    cooldown: Arc<CooldownEngine>,
    sink: Arc<dyn AnnouncementSink>,
    settings: CadenceSettings,
    detection_enabled: Arc<AtomicBool>,
    state: PipelineState,
}

impl DetectionCadenceController {
    pub fn new(
        detector: Box<dyn ObjectDetector>,
        cooldown: Arc<CooldownEngine>,
        sink: Arc<dyn AnnouncementSink>,
        settings: CadenceSettings,
    ) -> Self {
        Self {
            detector,
            cooldown,
            sink,
            settings,
            detection_enabled: Arc::new(AtomicBool::new(true)),
            state: PipelineState::default(),
        }
    }

    /// Starts from an existing state instead of an empty one.
    pub fn with_state(mut self, state: PipelineState) -> Self {
        self.state = state;
        self
    }

    /// Flag shared with the control surface; clearing it pauses detection.
    pub fn detection_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.detection_enabled)
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn process_frame(&mut self, frame: &mut Frame, now: Instant) -> CycleReport {
        let mut report = CycleReport::default();

        if !self.detection_enabled.load(Ordering::SeqCst) {
            if self.state.last_inference.is_some() || !self.state.detections.is_empty() {
                log::debug!("Detection disabled; clearing overlay");
                self.state = PipelineState {
                    started_at: self.state.started_at,
                    ..PipelineState::default()
                };
            }
            return report;
        }

        if self.state.started_at.is_none() {
            self.state.started_at = Some(now);
        }

        if self
            .state
            .inference_due(now, self.settings.inference_interval)
        {
            report.inference_ran = true;
            self.state.last_inference = Some(now);

            let started = Instant::now();
            let result = self.detector.detect(frame);
            report.inference_duration = Some(started.elapsed());

            match result {
                Ok(detections) => {
                    self.state.detections =
                        Detection::retain_confident(detections, self.settings.confidence_threshold);
                    report.announced = self.announce(now);
                }
                Err(e) => {
                    log::warn!("Detection failed, keeping previous overlay: {e}");
                    report.detector_failed = true;
                }
            }
        }

        draw_detections(frame, &self.state.detections);
        report.detection_count = self.state.detections.len();
        report
    }

    fn announce(&self, now: Instant) -> Vec<String> {
        let mut announced = Vec::new();
        for class_name in self.settings.policy.eligible_classes(&self.state.detections) {
            let accepted = self.cooldown.announce_if_due(class_name, now, || {
                let job = match AnnouncementJob::new(
                    class_name,
                    self.settings.repeat,
                    self.settings.repeat_gap,
                ) {
                    Ok(job) => job,
                    Err(e) => {
                        log::error!("Cannot announce {class_name}: {e}");
                        return false;
                    }
                };
                let outcome = self.sink.submit(job);
                log::debug!("Announcement of {class_name}: {outcome:?}");
                outcome.is_accepted()
            });
            if accepted {
                log::info!("Announcing {class_name}");
                announced.push(class_name.to_string());
            }
        }
        announced
    }
}
