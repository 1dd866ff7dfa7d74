//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over three strides followed by NMS. Frames are
//! letterboxed into the square model input and detections mapped back.

use crate::pipeline::RegionDetector;
use crate::types::{non_max_suppression, BoundingBox};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding applied when fitting a frame into the model input.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    pub fn fit(width: u32, height: u32, target: u32) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: (target as f32 - new_w) / 2.0,
            pad_y: (target as f32 - new_h) / 2.0,
        }
    }

    /// Map a point from model-input space back to frame space.
    pub fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }

    /// Resize `frame` and paste it centered into a `target`×`target` canvas.
    pub fn apply(&self, frame: &RgbImage, target: u32, fill: u8) -> RgbImage {
        let new_w = ((frame.width() as f32 * self.scale).round() as u32).clamp(1, target);
        let new_h = ((frame.height() as f32 * self.scale).round() as u32).clamp(1, target);
        let resized = image::imageops::resize(frame, new_w, new_h, FilterType::Triangle);

        let mut canvas = RgbImage::from_pixel(target, target, image::Rgb([fill; 3]));
        image::imageops::replace(
            &mut canvas,
            &resized,
            self.pad_x.floor() as i64,
            self.pad_y.floor() as i64,
        );
        canvas
    }
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputs = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    /// Per-stride output indices for strides [8, 16, 32].
    stride_outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(path = model_path, outputs = ?output_names, "loaded SCRFD model");

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_outputs = map_stride_outputs(&output_names);
        tracing::debug!(?stride_outputs, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            stride_outputs,
        })
    }

    /// Detect faces in an RGB frame, sorted by descending confidence.
    pub fn detect(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if frame.width() == 0 || frame.height() == 0 {
            return Ok(Vec::new());
        }
        let letterbox = Letterbox::fit(frame.width(), frame.height(), SCRFD_INPUT_SIZE);
        let input = to_tensor(&letterbox.apply(frame, SCRFD_INPUT_SIZE, SCRFD_MEAN as u8));

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_outputs[slot];
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let decoded = StrideDecoder {
                stride,
                letterbox: &letterbox,
                threshold: SCRFD_CONFIDENCE_THRESHOLD,
            }
            .decode(
                extract(score_idx, "scores")?,
                extract(bbox_idx, "bboxes")?,
                extract(kps_idx, "kps")?,
            );
            candidates.extend(decoded);
        }

        Ok(non_max_suppression(candidates, SCRFD_NMS_THRESHOLD))
    }
}

impl RegionDetector for FaceDetector {
    fn detect_regions(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        self.detect(frame)
    }
}

/// Normalize a letterboxed RGB canvas into an NCHW tensor.
fn to_tensor(canvas: &RgbImage) -> Array4<f32> {
    let (w, h) = (canvas.width() as usize, canvas.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, px) in canvas.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px.0[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }
    tensor
}

/// Resolve which output tensor carries scores/boxes/keypoints for each stride.
///
/// Exports either name tensors `score_8`, `bbox_16`, `kps_32`, ... or use
/// bare numbers; the latter get the standard positional layout
/// `[scores 8/16/32, bboxes 8/16/32, kps 8/16/32]`.
fn map_stride_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?, find("kps", s)?)))
        .collect();

    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => {
            tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Decodes the flat outputs of one stride level.
struct StrideDecoder<'a> {
    stride: usize,
    letterbox: &'a Letterbox,
    threshold: f32,
}

impl StrideDecoder<'_> {
    fn decode(&self, scores: &[f32], bboxes: &[f32], kps: &[f32]) -> Vec<BoundingBox> {
        let grid = SCRFD_INPUT_SIZE as usize / self.stride;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let step = self.stride as f32;

        (0..anchors.min(scores.len()))
            .filter(|&idx| scores[idx] > self.threshold)
            .filter_map(|idx| {
                let cell = idx / SCRFD_ANCHORS_PER_CELL;
                let ax = (cell % grid) as f32 * step;
                let ay = (cell / grid) as f32 * step;

                let d = bboxes.get(idx * 4..idx * 4 + 4)?;
                let (x1, y1) = self.letterbox.unmap(ax - d[0] * step, ay - d[1] * step);
                let (x2, y2) = self.letterbox.unmap(ax + d[2] * step, ay + d[3] * step);

                let landmarks = kps.get(idx * 10..idx * 10 + 10).map(|k| {
                    std::array::from_fn(|i| {
                        self.letterbox
                            .unmap(ax + k[i * 2] * step, ay + k[i * 2 + 1] * step)
                    })
                });

                Some(BoundingBox {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                    confidence: scores[idx],
                    class_id: 0,
                    landmarks,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_letterbox_roundtrip() {
        let lb = Letterbox::fit(320, 240, 640);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        assert!(lb.pad_x.abs() < 1e-6);
        assert!((lb.pad_y - 80.0).abs() < 1e-6);

        let (x, y) = lb.unmap(100.0 * lb.scale + lb.pad_x, 50.0 * lb.scale + lb.pad_y);
        assert!((x - 100.0).abs() < 0.1, "x: {x}");
        assert!((y - 50.0).abs() < 0.1, "y: {y}");
    }

    #[test]
    fn test_letterbox_apply_pads_with_fill() {
        let frame = RgbImage::from_pixel(64, 32, image::Rgb([200, 200, 200]));
        let lb = Letterbox::fit(64, 32, 64);
        let canvas = lb.apply(&frame, 64, 127);
        assert_eq!(canvas.dimensions(), (64, 64));
        assert_eq!(canvas.get_pixel(0, 0).0, [127, 127, 127]);
        assert_eq!(canvas.get_pixel(32, 32).0, [200, 200, 200]);
    }

    #[test]
    fn test_to_tensor_shape_and_normalization() {
        let canvas = RgbImage::from_pixel(8, 4, image::Rgb([255, 127, 0]));
        let t = to_tensor(&canvas);
        assert_eq!(t.shape(), &[1, 3, 4, 8]);
        assert!((t[[0, 0, 0, 0]] - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-6);
        assert!((t[[0, 2, 3, 7]] - (0.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-6);
    }

    #[test]
    fn test_map_stride_outputs_named() {
        let names: Vec<String> = [
            "score_8", "score_16", "score_32", "bbox_8", "bbox_16", "bbox_32", "kps_8",
            "kps_16", "kps_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(map_stride_outputs(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_map_stride_outputs_shuffled() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32",
            "kps_32", "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(map_stride_outputs(&names), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_map_stride_outputs_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| (i + 400).to_string()).collect();
        assert_eq!(map_stride_outputs(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_stride_decoder_single_anchor() {
        let lb = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 0.0,
        };
        let stride = 32;
        let grid = 640 / stride;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;

        let mut scores = vec![0.0f32; anchors];
        let mut bboxes = vec![0.0f32; anchors * 4];
        let kps = vec![0.0f32; anchors * 10];

        // Anchor in cell (x=2, y=1), first of the pair
        let idx = (grid + 2) * SCRFD_ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let dets = StrideDecoder {
            stride,
            letterbox: &lb,
            threshold: 0.5,
        }
        .decode(&scores, &bboxes, &kps);

        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert!((d.x - 32.0).abs() < 1e-4, "x = {}", d.x);
        assert!((d.y - 0.0).abs() < 1e-4, "y = {}", d.y);
        assert!((d.width - 64.0).abs() < 1e-4);
        assert!((d.height - 64.0).abs() < 1e-4);
        let lms = d.landmarks.expect("landmarks decoded");
        assert!((lms[0].0 - 64.0).abs() < 1e-4);
        assert!((lms[0].1 - 32.0).abs() < 1e-4);
    }

    #[test]
    fn test_stride_decoder_threshold() {
        let lb = Letterbox::fit(640, 640, 640);
        let scores = vec![0.5f32; 8];
        let bboxes = vec![1.0f32; 32];
        let dets = StrideDecoder {
            stride: 32,
            letterbox: &lb,
            threshold: 0.5,
        }
        .decode(&scores, &bboxes, &[]);
        assert!(dets.is_empty());
    }
}
