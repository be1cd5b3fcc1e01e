//! YOLO object detector using ONNX Runtime via `ort`.
//!
//! Handles letterbox preprocessing, inference, and class-aware NMS for
//! Ultralytics-style detection heads (`[1, 4 + classes, candidates]`).
use std::path::Path;

use crate::detection::domain::object_detector::ObjectDetector;
use crate::shared::detection::{BoundingBox, Detection};
use crate::shared::frame::Frame;

use super::coco_classes::class_name;

/// Fallback YOLO model input resolution when the model doesn't specify dimensions.
const DEFAULT_INPUT_SIZE: u32 = 640;

/// Minimum class score for a candidate to survive decoding.
pub const DEFAULT_CONFIDENCE: f64 = 0.25;

/// NMS IoU threshold.
const NMS_IOU_THRESH: f64 = 0.7;

/// Hardware acceleration for the current platform. ONNX Runtime drops to
/// CPU on its own when the provider cannot be registered.
fn platform_providers() -> Vec<ort::execution_providers::ExecutionProviderDispatch> {
    #[cfg(target_os = "macos")]
    {
        log::debug!("Requesting CoreML execution provider");
        vec![ort::execution_providers::CoreMLExecutionProvider::default().build()]
    }
    #[cfg(target_os = "windows")]
    {
        log::debug!("Requesting DirectML execution provider");
        vec![ort::execution_providers::DirectMLExecutionProvider::default().build()]
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        log::debug!("Using CPU execution provider");
        Vec::new()
    }
}

/// YOLO object detector backed by an ONNX Runtime session.
pub struct OnnxYoloDetector {
    session: ort::session::Session,
    confidence: f64,
    input_size: u32,
}

impl OnnxYoloDetector {
    /// Load a YOLO ONNX model and prepare for inference.
    ///
    /// The input resolution is read from the model's input shape (expecting NCHW).
    /// Falls back to 640 if the shape is dynamic or unreadable.
    pub fn new(model_path: &Path, confidence: f64) -> Result<Self, Box<dyn std::error::Error>> {
        let intra_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let session = ort::session::Session::builder()?
            .with_intra_threads(intra_threads)?
            .with_execution_providers(platform_providers())?
            .commit_from_file(model_path)?;

        let input_size = session
            .inputs()
            .first()
            .and_then(|input| match input.dtype() {
                ort::value::ValueType::Tensor { ref shape, .. }
                    if shape.len() >= 4 && shape[2] > 0 =>
                {
                    Some(shape[2] as u32)
                }
                _ => None,
            })
            .unwrap_or(DEFAULT_INPUT_SIZE);

        log::info!(
            "Loaded YOLO model {} (input {input_size}x{input_size})",
            model_path.display()
        );

        Ok(Self {
            session,
            confidence,
            input_size,
        })
    }
}

impl ObjectDetector for OnnxYoloDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, Box<dyn std::error::Error>> {
        let (input_tensor, geometry) = letterbox(frame, self.input_size);

        let input_value = ort::value::Tensor::from_array(input_tensor)?;
        let outputs = self.session.run(ort::inputs![input_value])?;
        if outputs.len() == 0 {
            return Err("YOLO model produced no outputs".into());
        }
        let tensor = outputs[0].try_extract_array::<f32>()?;
        let data = tensor.as_slice().ok_or("Cannot get tensor slice")?;

        let mut candidates = decode_predictions(data, tensor.shape(), self.confidence, &geometry)?;
        let kept = nms(&mut candidates, NMS_IOU_THRESH);

        Ok(kept
            .into_iter()
            .map(|c| Detection::new(c.bbox, class_name(c.class_id), c.confidence))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Preprocessing
// ---------------------------------------------------------------------------

/// Mapping between letterboxed model coordinates and the source frame.
#[derive(Clone, Copy, Debug, PartialEq)]
struct LetterboxGeometry {
    scale: f64,
    pad_x: u32,
    pad_y: u32,
    frame_w: u32,
    frame_h: u32,
}

impl LetterboxGeometry {
    /// Maps a model-space center box back to clipped frame coordinates.
    fn unmap(&self, cx: f64, cy: f64, w: f64, h: f64) -> BoundingBox {
        let fw = self.frame_w as f64;
        let fh = self.frame_h as f64;
        let x = |v: f64| ((v - self.pad_x as f64) / self.scale).clamp(0.0, fw);
        let y = |v: f64| ((v - self.pad_y as f64) / self.scale).clamp(0.0, fh);
        BoundingBox::new(
            x(cx - w / 2.0),
            y(cy - h / 2.0),
            x(cx + w / 2.0),
            y(cy + h / 2.0),
        )
    }
}

/// Letterbox-resize a frame to `target_size` × `target_size`.
///
/// Returns the NCHW float32 tensor and the geometry needed to map boxes back.
fn letterbox(frame: &Frame, target_size: u32) -> (ndarray::Array4<f32>, LetterboxGeometry) {
    let fw = frame.width() as f64;
    let fh = frame.height() as f64;
    let target = target_size as f64;

    let scale = (target / fw).min(target / fh);
    let new_w = (fw * scale).round() as u32;
    let new_h = (fh * scale).round() as u32;
    let pad_x = (target_size - new_w) / 2;
    let pad_y = (target_size - new_h) / 2;

    // Padding is 114/255 gray, the YOLO training convention.
    let gray = 114.0f32 / 255.0;
    let mut tensor =
        ndarray::Array4::<f32>::from_elem((1, 3, target_size as usize, target_size as usize), gray);

    let src = frame.as_ndarray();
    let src_h = frame.height() as usize;
    let src_w = frame.width() as usize;

    for y in 0..new_h as usize {
        let src_y = ((y as f64 / scale) as usize).min(src_h - 1);
        for x in 0..new_w as usize {
            let src_x = ((x as f64 / scale) as usize).min(src_w - 1);
            let ty = pad_y as usize + y;
            let tx = pad_x as usize + x;
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = src[[src_y, src_x, c]] as f32 / 255.0;
            }
        }
    }

    let geometry = LetterboxGeometry {
        scale,
        pad_x,
        pad_y,
        frame_w: frame.width(),
        frame_h: frame.height(),
    };
    (tensor, geometry)
}

// ---------------------------------------------------------------------------
// Postprocessing
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct Candidate {
    bbox: BoundingBox,
    class_id: usize,
    confidence: f64,
}

/// Decodes a `[1, 4 + classes, N]` (or `[1, N, 4 + classes]`) output into
/// candidates whose best class score reaches `min_confidence`.
fn decode_predictions(
    data: &[f32],
    shape: &[usize],
    min_confidence: f64,
    geometry: &LetterboxGeometry,
) -> Result<Vec<Candidate>, Box<dyn std::error::Error>> {
    if shape.len() != 3 {
        return Err(format!("Unexpected YOLO output shape: {shape:?}").into());
    }
    // Heads are usually transposed: fewer features than candidates.
    let transposed = shape[1] < shape[2];
    let (num_candidates, num_features) = if transposed {
        (shape[2], shape[1])
    } else {
        (shape[1], shape[2])
    };
    if num_features <= 4 {
        return Err(format!("YOLO output has no class scores: {shape:?}").into());
    }
    if data.len() < num_candidates * num_features {
        return Err("YOLO output shorter than its shape".into());
    }

    let value = |candidate: usize, feature: usize| -> f64 {
        let idx = if transposed {
            feature * num_candidates + candidate
        } else {
            candidate * num_features + feature
        };
        data[idx] as f64
    };

    let mut candidates = Vec::new();
    for i in 0..num_candidates {
        let (class_id, confidence) = (4..num_features)
            .map(|f| (f - 4, value(i, f)))
            .fold((0, f64::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
        if confidence < min_confidence {
            continue;
        }
        let bbox = geometry.unmap(value(i, 0), value(i, 1), value(i, 2), value(i, 3));
        candidates.push(Candidate {
            bbox,
            class_id,
            confidence,
        });
    }
    Ok(candidates)
}

/// Greedy class-aware NMS: sort by confidence descending, suppress
/// overlapping boxes of the same class.
fn nms(candidates: &mut [Candidate], iou_thresh: f64) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; candidates.len()];

    for i in 0..candidates.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(candidates[i].clone());
        for j in (i + 1)..candidates.len() {
            if suppressed[j] || candidates[j].class_id != candidates[i].class_id {
                continue;
            }
            if candidates[i].bbox.iou(&candidates[j].bbox) > iou_thresh {
                suppressed[j] = true;
            }
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const IDENTITY: LetterboxGeometry = LetterboxGeometry {
        scale: 1.0,
        pad_x: 0,
        pad_y: 0,
        frame_w: 640,
        frame_h: 640,
    };

    /// Builds a transposed `[1, 4 + classes, n]` head from candidate rows,
    /// padding with all-zero candidates.
    fn transposed_head(rows: &[Vec<f32>], n: usize) -> (Vec<f32>, Vec<usize>) {
        let features = rows[0].len();
        let mut data = vec![0.0f32; features * n];
        for (i, row) in rows.iter().enumerate() {
            for (f, &v) in row.iter().enumerate() {
                data[f * n + i] = v;
            }
        }
        (data, vec![1, features, n])
    }

    fn candidate(x1: f64, y1: f64, x2: f64, y2: f64, class_id: usize, conf: f64) -> Candidate {
        Candidate {
            bbox: BoundingBox::new(x1, y1, x2, y2),
            class_id,
            confidence: conf,
        }
    }

    #[test]
    fn test_letterbox_preserves_aspect_ratio() {
        // 200x100 → scale 3.2, content 640x320, 160 px of padding above and below.
        let frame = Frame::filled(200, 100, [128, 128, 128], 0);
        let (tensor, geometry) = letterbox(&frame, 640);

        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_relative_eq!(geometry.scale, 3.2, epsilon = 0.01);
        assert_eq!(geometry.pad_x, 0);
        assert_eq!(geometry.pad_y, 160);
    }

    #[test]
    fn test_letterbox_values_normalized() {
        let frame = Frame::filled(100, 50, [255, 255, 255], 0);
        let (tensor, geometry) = letterbox(&frame, 640);

        let y = geometry.pad_y as usize + 1;
        assert_relative_eq!(tensor[[0, 0, y, 1]], 1.0, epsilon = 0.01);
        assert_relative_eq!(tensor[[0, 0, 0, 0]], 114.0 / 255.0, epsilon = 0.01);
    }

    #[test]
    fn test_unmap_removes_padding_and_scale() {
        let geometry = LetterboxGeometry {
            scale: 2.0,
            pad_x: 0,
            pad_y: 80,
            frame_w: 320,
            frame_h: 240,
        };
        let bbox = geometry.unmap(200.0, 280.0, 100.0, 80.0);
        assert_relative_eq!(bbox.x1, 75.0);
        assert_relative_eq!(bbox.y1, 80.0);
        assert_relative_eq!(bbox.x2, 125.0);
        assert_relative_eq!(bbox.y2, 120.0);
    }

    #[test]
    fn test_unmap_clips_to_frame() {
        let bbox = IDENTITY.unmap(10.0, 630.0, 40.0, 40.0);
        assert_relative_eq!(bbox.x1, 0.0);
        assert_relative_eq!(bbox.y2, 640.0);
    }

    #[test]
    fn test_decode_picks_best_class_per_candidate() {
        // cx, cy, w, h, then scores for three classes.
        let rows = vec![
            vec![100.0, 100.0, 20.0, 40.0, 0.1, 0.8, 0.05],
            vec![300.0, 300.0, 50.0, 50.0, 0.9, 0.2, 0.0],
        ];
        let (data, shape) = transposed_head(&rows, 16);

        let decoded = decode_predictions(&data, &shape, 0.25, &IDENTITY).unwrap();

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].class_id, 1);
        assert_relative_eq!(decoded[0].confidence, 0.8, epsilon = 1e-6);
        assert_relative_eq!(decoded[0].bbox.x1, 90.0);
        assert_relative_eq!(decoded[0].bbox.y1, 80.0);
        assert_eq!(decoded[1].class_id, 0);
    }

    #[test]
    fn test_decode_drops_low_scores() {
        let rows = vec![vec![100.0, 100.0, 20.0, 20.0, 0.2, 0.1]];
        let (data, shape) = transposed_head(&rows, 8);
        let decoded = decode_predictions(&data, &shape, 0.25, &IDENTITY).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_decode_row_major_layout() {
        // [1, candidates, features] with more candidates than features.
        let features = 6;
        let n = 8;
        let mut data = vec![0.0f32; n * features];
        data[..features].copy_from_slice(&[50.0, 50.0, 10.0, 10.0, 0.0, 0.7]);

        let decoded = decode_predictions(&data, &[1, n, features], 0.25, &IDENTITY).unwrap();

        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].class_id, 1);
    }

    #[test]
    fn test_decode_rejects_bad_shapes() {
        assert!(decode_predictions(&[0.0; 8], &[8], 0.25, &IDENTITY).is_err());
        assert!(decode_predictions(&[0.0; 32], &[1, 4, 8], 0.25, &IDENTITY).is_err());
        assert!(decode_predictions(&[0.0; 4], &[1, 6, 8], 0.25, &IDENTITY).is_err());
    }

    #[test]
    fn test_nms_suppresses_overlapping_same_class() {
        let mut dets = vec![
            candidate(0.0, 0.0, 100.0, 100.0, 0, 0.8),
            candidate(5.0, 5.0, 105.0, 105.0, 0, 0.9),
        ];
        let kept = nms(&mut dets, 0.7);
        assert_eq!(kept.len(), 1);
        assert_relative_eq!(kept[0].confidence, 0.9);
    }

    #[test]
    fn test_nms_keeps_overlapping_different_classes() {
        let mut dets = vec![
            candidate(0.0, 0.0, 100.0, 100.0, 0, 0.9),
            candidate(2.0, 2.0, 102.0, 102.0, 16, 0.8),
        ];
        let kept = nms(&mut dets, 0.7);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_nms_keeps_non_overlapping() {
        let mut dets = vec![
            candidate(0.0, 0.0, 50.0, 50.0, 0, 0.9),
            candidate(200.0, 200.0, 250.0, 250.0, 0, 0.8),
        ];
        assert_eq!(nms(&mut dets, 0.7).len(), 2);
    }

    #[test]
    fn test_nms_empty_input() {
        let mut dets: Vec<Candidate> = Vec::new();
        assert!(nms(&mut dets, 0.7).is_empty());
    }

    #[test]
    fn test_missing_model_fails_to_load() {
        let result = OnnxYoloDetector::new(Path::new("/nonexistent/yolo11s.onnx"), 0.25);
        assert!(result.is_err());
    }
}
