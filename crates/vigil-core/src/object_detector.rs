//! YOLOv8 object detector via ONNX Runtime.
//!
//! Expects an ultralytics ONNX export with one output shaped
//! `[1, 4 + classes, proposals]` (rows: cx, cy, w, h, then per-class scores).

use crate::detector::{DetectorError, Letterbox};
use crate::pipeline::{AdjustableDetector, RegionDetector};
use crate::types::{non_max_suppression, BoundingBox};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use std::path::Path;

const YOLO_INPUT_SIZE: u32 = 640;
/// Ultralytics letterbox fill value.
const YOLO_PAD_VALUE: u8 = 114;

/// Filtering applied to raw YOLO proposals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionParams {
    /// Minimum class score in [0, 1].
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Class ids to keep; empty keeps every class.
    pub classes: Vec<usize>,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            iou_threshold: 0.45,
            classes: vec![0],
        }
    }
}

impl DetectionParams {
    fn allows(&self, class_id: usize) -> bool {
        self.classes.is_empty() || self.classes.contains(&class_id)
    }
}

/// YOLOv8 detector (weapon model by default).
pub struct ObjectDetector {
    session: Session,
    params: DetectionParams,
}

impl ObjectDetector {
    pub fn load(model_path: &str, params: DetectionParams) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            confidence_threshold = params.confidence_threshold,
            classes = ?params.classes,
            "loaded YOLO model"
        );

        Ok(Self { session, params })
    }

    /// Detect objects passing the configured threshold and class filter.
    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }
        let letterbox = Letterbox::fit(frame.width(), frame.height(), YOLO_INPUT_SIZE);
        let input = to_tensor(&letterbox.apply(frame, YOLO_INPUT_SIZE, YOLO_PAD_VALUE));

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| DetectorError::InferenceFailed(format!("output tensor: {e}")))?;

        if shape.len() != 3 || shape[1] < 5 {
            return Err(DetectorError::InferenceFailed(format!(
                "unexpected YOLO output shape {:?}",
                &shape[..]
            )));
        }
        let rows = shape[1] as usize;
        let proposals = shape[2] as usize;

        let candidates = decode_proposals(data, rows, proposals, &letterbox, &self.params);
        Ok(non_max_suppression(candidates, self.params.iou_threshold))
    }
}

impl RegionDetector for ObjectDetector {
    fn detect_regions(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        self.detect(frame)
    }
}

impl AdjustableDetector for ObjectDetector {
    /// Clamped to [0, 1]; applies from the next `detect` call.
    fn set_confidence_threshold(&mut self, threshold: f32) {
        let threshold = threshold.clamp(0.0, 1.0);
        if threshold != self.params.confidence_threshold {
            tracing::debug!(threshold, "confidence threshold changed");
            self.params.confidence_threshold = threshold;
        }
    }
}

fn to_tensor(canvas: &RgbImage) -> Array4<f32> {
    let (w, h) = (canvas.width() as usize, canvas.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, px) in canvas.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = px.0[c] as f32 / 255.0;
        }
    }
    tensor
}

/// Turn the column-major `[rows, proposals]` block into frame-space boxes.
fn decode_proposals(
    data: &[f32],
    rows: usize,
    proposals: usize,
    letterbox: &Letterbox,
    params: &DetectionParams,
) -> Vec<BoundingBox> {
    if data.len() < rows * proposals {
        return Vec::new();
    }
    let at = |row: usize, i: usize| data[row * proposals + i];

    (0..proposals)
        .filter_map(|i| {
            let (class_id, score) = (0..rows - 4)
                .map(|c| (c, at(4 + c, i)))
                .fold((0, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });

            if score < params.confidence_threshold || !params.allows(class_id) {
                return None;
            }

            let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
            let (x1, y1) = letterbox.unmap(cx - w / 2.0, cy - h / 2.0);
            let (x2, y2) = letterbox.unmap(cx + w / 2.0, cy + h / 2.0);

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                class_id,
                landmarks: None,
            })
        })
        .collect()
}
