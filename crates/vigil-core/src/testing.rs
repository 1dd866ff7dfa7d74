//! Scripted stand-ins for the ONNX models.
//!
//! Compiled for this crate's tests and, through the `testing` feature, for
//! downstream test suites.

use crate::detector::DetectorError;
use crate::pipeline::{AdjustableDetector, EmbedError, FaceEmbedder, RegionDetector};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use std::collections::VecDeque;

/// Square class-0 box at `(x, y)`.
pub fn region(x: f32, y: f32, size: f32, confidence: f32) -> BoundingBox {
    BoundingBox {
        x,
        y,
        width: size,
        height: size,
        confidence,
        class_id: 0,
        landmarks: None,
    }
}

/// Returns the same regions for every frame, minus those under its threshold.
pub struct FixedDetector {
    regions: Vec<BoundingBox>,
    min_confidence: f32,
}

impl FixedDetector {
    pub fn new(regions: Vec<BoundingBox>) -> Self {
        Self {
            regions,
            min_confidence: 0.0,
        }
    }
}

impl RegionDetector for FixedDetector {
    fn detect_regions(&mut self, _frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        Ok(self
            .regions
            .iter()
            .filter(|r| r.confidence >= self.min_confidence)
            .cloned()
            .collect())
    }
}

impl AdjustableDetector for FixedDetector {
    fn set_confidence_threshold(&mut self, threshold: f32) {
        self.min_confidence = threshold;
    }
}

pub struct FailingDetector;

impl RegionDetector for FailingDetector {
    fn detect_regions(&mut self, _frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        Err(DetectorError::InferenceFailed("scripted".into()))
    }
}

/// Hands out scripted results in call order, then `NoUsableFace`.
pub struct ScriptedEmbedder(pub VecDeque<Result<Embedding, EmbedError>>);

impl ScriptedEmbedder {
    pub fn new(results: Vec<Result<Embedding, EmbedError>>) -> Self {
        Self(results.into())
    }
}

impl FaceEmbedder for ScriptedEmbedder {
    fn embed(&mut self, _frame: &RgbImage, _region: &BoundingBox) -> Result<Embedding, EmbedError> {
        self.0.pop_front().unwrap_or(Err(EmbedError::NoUsableFace))
    }
}
