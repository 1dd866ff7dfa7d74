//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts 512-dimensional embeddings from aligned 112×112 face crops
//! using the w600k_r50 model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::pipeline::{EmbedError, FaceEmbedder};
use crate::types::{BoundingBox, Embedding};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// ArcFace normalizes symmetrically, unlike SCRFD.
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;
const ARCFACE_MODEL_VERSION: &str = "w600k_r50";
/// Regions smaller than this on either side carry no usable face.
const MIN_FACE_SIDE: u32 = 8;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based face embedder.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, RecognizerError> {
        if !Path::new(model_path).exists() {
            return Err(RecognizerError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Extract an L2-normalized embedding for one detected face.
    ///
    /// Faces with landmarks are aligned to the canonical layout; others are
    /// cropped from their box and resized.
    pub fn extract(&mut self, frame: &RgbImage, face: &BoundingBox) -> Result<Embedding, EmbedError> {
        let crop = face_crop(frame, face)?;
        let input = preprocess(&crop);

        let failed = |e: ort::Error| EmbedError::ExtractionFailed(e.to_string());
        let tensor = TensorRef::from_array_view(input.view()).map_err(failed)?;
        let outputs = self.session.run(ort::inputs![tensor]).map_err(failed)?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedError::ExtractionFailed(format!("embedding tensor: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(EmbedError::ExtractionFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding {
            values: l2_normalize(raw),
            model_version: Some(ARCFACE_MODEL_VERSION.to_string()),
        })
    }
}

impl FaceEmbedder for FaceRecognizer {
    fn embed(&mut self, frame: &RgbImage, region: &BoundingBox) -> Result<Embedding, EmbedError> {
        self.extract(frame, region)
    }
}

/// Produce the 112×112 model input for one face region.
fn face_crop(frame: &RgbImage, face: &BoundingBox) -> Result<RgbImage, EmbedError> {
    let (x, y, w, h) = face
        .clip_to(frame.width(), frame.height())
        .ok_or(EmbedError::NoUsableFace)?;
    if w < MIN_FACE_SIDE || h < MIN_FACE_SIDE {
        return Err(EmbedError::NoUsableFace);
    }

    Ok(match &face.landmarks {
        Some(landmarks) => alignment::align_face(frame, landmarks),
        None => {
            let region = image::imageops::crop_imm(frame, x, y, w, h).to_image();
            image::imageops::resize(&region, ALIGNED_SIZE, ALIGNED_SIZE, FilterType::Triangle)
        }
    })
}

fn preprocess(face: &RgbImage) -> Array4<f32> {
    let size = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, px) in face.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px.0[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|v| v / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn region(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence: 0.9,
            class_id: 0,
            landmarks: None,
        }
    }

    #[test]
    fn test_preprocess_shape_and_normalization() {
        let face = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Rgb([255, 0, 128]));
        let t = preprocess(&face);
        assert_eq!(t.shape(), &[1, 3, 112, 112]);
        assert!((t[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((t[[0, 1, 5, 5]] + 1.0).abs() < 1e-6);
        let expected = (128.0 - ARCFACE_MEAN) / ARCFACE_STD;
        assert!((t[[0, 2, 5, 5]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_face_crop_without_landmarks_resizes() {
        let frame = RgbImage::from_pixel(320, 240, Rgb([90, 90, 90]));
        let crop = face_crop(&frame, &region(100.0, 50.0, 60.0, 80.0)).unwrap();
        assert_eq!(crop.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert_eq!(crop.get_pixel(10, 10).0, [90, 90, 90]);
    }

    #[test]
    fn test_face_crop_outside_frame_is_unusable() {
        let frame = RgbImage::new(100, 100);
        assert!(matches!(
            face_crop(&frame, &region(150.0, 150.0, 40.0, 40.0)),
            Err(EmbedError::NoUsableFace)
        ));
    }

    #[test]
    fn test_face_crop_tiny_region_is_unusable() {
        let frame = RgbImage::new(100, 100);
        assert!(matches!(
            face_crop(&frame, &region(10.0, 10.0, 3.0, 40.0)),
            Err(EmbedError::NoUsableFace)
        ));
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
