pub const YOLO_MODEL_NAME: &str = "yolo11s.onnx";

/// Container extensions accepted when switching the source to a video file.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "webm", "flv", "wmv", "m4v"];

/// Overlay color for detection boxes and labels (RGB).
pub const OVERLAY_COLOR: [u8; 3] = [0, 200, 0];

/// Boundary token separating parts of the MJPEG stream.
pub const MJPEG_BOUNDARY: &str = "frame";
