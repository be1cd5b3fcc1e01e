use std::collections::BTreeSet;

/// Axis-aligned box in frame pixel coordinates (`x1,y1` top-left, `x2,y2`
/// bottom-right). Coordinates may fall outside the frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingBox {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BoundingBox {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f64 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f64 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f64 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        let union = self.width() * self.height() + other.width() * other.height() - inter;
        inter / union
    }

    /// Integer pixel rectangle `(left, top, right, bottom)` clamped to a
    /// `frame_w` x `frame_h` frame, inclusive on both ends.
    ///
    /// Returns `None` when the box lies entirely outside the frame or the
    /// frame is empty.
    pub fn to_pixel_rect(&self, frame_w: u32, frame_h: u32) -> Option<(u32, u32, u32, u32)> {
        if frame_w == 0 || frame_h == 0 {
            return None;
        }
        let max_x = (frame_w - 1) as f64;
        let max_y = (frame_h - 1) as f64;
        if self.x2 < 0.0 || self.y2 < 0.0 || self.x1 > max_x || self.y1 > max_y {
            return None;
        }
        let left = self.x1.clamp(0.0, max_x).round() as u32;
        let top = self.y1.clamp(0.0, max_y).round() as u32;
        let right = self.x2.clamp(0.0, max_x).round() as u32;
        let bottom = self.y2.clamp(0.0, max_y).round() as u32;
        if right < left || bottom < top {
            return None;
        }
        Some((left, top, right, bottom))
    }
}

/// One recognized object instance produced by an inference cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class_name: String,
    pub confidence: f64,
}

impl Detection {
    pub fn new(bbox: BoundingBox, class_name: impl Into<String>, confidence: f64) -> Self {
        Self {
            bbox,
            class_name: class_name.into(),
            confidence,
        }
    }

    /// Keeps detections whose confidence is at or above `threshold`.
    pub fn retain_confident(detections: Vec<Detection>, threshold: f64) -> Vec<Detection> {
        detections
            .into_iter()
            .filter(|d| d.confidence >= threshold)
            .collect()
    }

    /// Distinct class names present in `detections`, in sorted order.
    pub fn distinct_classes(detections: &[Detection]) -> BTreeSet<&str> {
        detections.iter().map(|d| d.class_name.as_str()).collect()
    }

    /// Overlay label, e.g. `person 0.87`.
    pub fn label(&self) -> String {
        format!("{} {:.2}", self.class_name, self.confidence)
    }
}
