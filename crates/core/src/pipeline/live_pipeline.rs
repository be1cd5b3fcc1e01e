use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::shared::config::AlertConfig;
use crate::video::domain::frame_sink::FrameSink;

use super::detection_cadence_controller::DetectionCadenceController;
use super::pipeline_logger::PipelineLogger;
use super::video_source_controller::{PullOutcome, VideoSourceController};

/// Longest single sleep before the cancel flag is checked again.
const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct LiveSettings {
    /// Pause after each emitted frame; caps the output frame rate.
    pub frame_delay: Duration,
    /// Back-off after a source that could not be opened.
    pub retry_delay: Duration,
    /// Stop after this many emitted frames. `None` runs until cancelled.
    pub max_frames: Option<usize>,
}

impl From<&AlertConfig> for LiveSettings {
    fn from(config: &AlertConfig) -> Self {
        Self {
            frame_delay: config.frame_delay(),
            retry_delay: config.source_retry_delay(),
            max_frames: None,
        }
    }
}

/// Counters for one [`LivePipeline::run`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: usize,
    pub inference_cycles: usize,
    pub detector_failures: usize,
    pub announcements: usize,
    pub source_retries: usize,
    pub sink_failures: usize,
}

/// The pull loop: source → cadence controller → frame sink.
///
/// Runs on the caller's thread until the cancel flag is set or
/// `max_frames` frames were emitted. Source errors never end the run.
pub struct LivePipeline {
    source: VideoSourceController,
    cadence: DetectionCadenceController,
    sink: Box<dyn FrameSink>,
    logger: Box<dyn PipelineLogger>,
    settings: LiveSettings,
    cancelled: Arc<AtomicBool>,
}

impl LivePipeline {
    pub fn new(
        source: VideoSourceController,
        cadence: DetectionCadenceController,
        sink: Box<dyn FrameSink>,
        logger: Box<dyn PipelineLogger>,
        settings: LiveSettings,
        cancelled: Option<Arc<AtomicBool>>,
    ) -> Self {
        Self {
            source,
            cadence,
            sink,
            logger,
            settings,
            cancelled: cancelled.unwrap_or_else(|| Arc::new(AtomicBool::new(false))),
        }
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn run(&mut self) -> RunSummary {
        let mut summary = RunSummary::default();
        self.logger
            .info(&format!("Streaming from {}", self.source.state().source));

        while !self.is_cancelled() {
            if self
                .settings
                .max_frames
                .is_some_and(|max| summary.frames >= max)
            {
                break;
            }

            let mut frame = match self.source.pull() {
                PullOutcome::Frame(frame) => frame,
                PullOutcome::EndOfStream => continue,
                PullOutcome::RetryableError(reason) => {
                    summary.source_retries += 1;
                    log::debug!("Retrying in {:?}: {reason}", self.settings.retry_delay);
                    self.sleep(self.settings.retry_delay);
                    continue;
                }
            };

            let report = self.cadence.process_frame(&mut frame, Instant::now());
            if report.inference_ran {
                summary.inference_cycles += 1;
                if let Some(duration) = report.inference_duration {
                    self.logger
                        .timing("detect", duration.as_secs_f64() * 1000.0);
                }
                self.logger
                    .metric("detections", report.detection_count as f64);
            }
            if report.detector_failed {
                summary.detector_failures += 1;
            }
            summary.announcements += report.announced.len();

            let started = Instant::now();
            match self.sink.emit(&frame) {
                Ok(()) => {
                    self.logger
                        .timing("emit", started.elapsed().as_secs_f64() * 1000.0);
                    self.logger.frame_emitted();
                    summary.frames += 1;
                }
                Err(e) => {
                    log::warn!("Dropping frame {}: {e}", frame.index());
                    summary.sink_failures += 1;
                }
            }

            self.sleep(self.settings.frame_delay);
        }

        self.source.release();
        self.logger.info(&format!(
            "Stopped after {} frames, {} inference cycles, {} announcements",
            summary.frames, summary.inference_cycles, summary.announcements
        ));
        self.logger.summary();
        summary
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) {
        let started = Instant::now();
        loop {
            let elapsed = started.elapsed();
            if elapsed >= duration || self.is_cancelled() {
                return;
            }
            std::thread::sleep((duration - elapsed).min(CANCEL_POLL));
        }
    }
}
