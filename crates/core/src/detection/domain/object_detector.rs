use crate::shared::detection::Detection;
use crate::shared::frame::Frame;

/// Domain interface for object detection.
///
/// Implementations may hold inference sessions that need exclusive access,
/// hence `&mut self`. Returned detections are in frame pixel coordinates and
/// are not yet filtered by the alerting confidence threshold.
pub trait ObjectDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, Box<dyn std::error::Error>>;
}
