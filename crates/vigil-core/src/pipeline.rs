//! Per-frame processing: the seam between the streaming loop and the models.

use crate::annotate::{self, FACE_COLOR, MATCH_COLOR, OBJECT_COLOR};
use crate::detector::DetectorError;
use crate::reference::ReferenceStore;
use crate::types::{Alert, BoundingBox, CosineMatcher, Embedding, Matcher};
use image::RgbImage;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Why one region produced no embedding.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbedError {
    #[error("no usable face in region")]
    NoUsableFace,
    #[error("embedding extraction failed: {0}")]
    ExtractionFailed(String),
}

/// Failure to turn a whole image into one reference embedding.
#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Embed(#[from] EmbedError),
}

/// Finds candidate regions (faces or objects) in a frame.
pub trait RegionDetector {
    fn detect_regions(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Turns one region of a frame into an embedding.
pub trait FaceEmbedder {
    fn embed(&mut self, frame: &RgbImage, region: &BoundingBox) -> Result<Embedding, EmbedError>;
}

/// A detector whose score cut-off can change between frames.
pub trait AdjustableDetector: RegionDetector {
    fn set_confidence_threshold(&mut self, threshold: f32);
}

/// A threshold in `[0, 1]` shared between a running processor and its
/// controls. Readers see the latest value on their next frame.
#[derive(Debug, Clone)]
pub struct SharedThreshold(Arc<AtomicU32>);

impl SharedThreshold {
    pub fn new(value: f32) -> Self {
        let threshold = Self(Arc::new(AtomicU32::new(0)));
        threshold.set(value);
        threshold
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Store `value`, clamped to `[0, 1]`, and return what was stored.
    pub fn set(&self, value: f32) -> f32 {
        let value = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        self.0.store(value.to_bits(), Ordering::Relaxed);
        value
    }
}

impl<T: RegionDetector + ?Sized> RegionDetector for Box<T> {
    fn detect_regions(&mut self, frame: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        (**self).detect_regions(frame)
    }
}

impl<T: FaceEmbedder + ?Sized> FaceEmbedder for Box<T> {
    fn embed(&mut self, frame: &RgbImage, region: &BoundingBox) -> Result<Embedding, EmbedError> {
        (**self).embed(frame, region)
    }
}

/// Embed the highest-confidence face in `image`.
pub fn embed_best_face<D, E>(
    detector: &mut D,
    embedder: &mut E,
    image: &RgbImage,
) -> Result<Embedding, EnrollError>
where
    D: RegionDetector + ?Sized,
    E: FaceEmbedder + ?Sized,
{
    let faces = detector.detect_regions(image)?;
    let best = faces
        .into_iter()
        .max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .ok_or(EnrollError::NoFaceDetected)?;

    tracing::debug!(confidence = best.confidence, "enroll: best face selected");
    Ok(embedder.embed(image, &best)?)
}

/// Outcome of processing one frame.
#[derive(Debug, Default, Clone)]
pub struct FrameReport {
    pub regions: usize,
    pub embed_failures: usize,
    pub detect_failed: bool,
    /// Alerts in evaluation order; the last one is what the slot keeps.
    pub alerts: Vec<Alert>,
}

/// Annotates a frame in place and reports what it found.
pub trait FrameProcessor {
    fn name(&self) -> &'static str;
    fn process(&mut self, frame: &mut RgbImage) -> FrameReport;
}

impl<T: FrameProcessor + ?Sized> FrameProcessor for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn process(&mut self, frame: &mut RgbImage) -> FrameReport {
        (**self).process(frame)
    }
}

/// Face alert pipeline: detect, embed, match against the reference set.
pub struct FaceAlertProcessor<D, E> {
    detector: D,
    embedder: E,
    references: Arc<ReferenceStore>,
    threshold: f32,
}

impl<D: RegionDetector, E: FaceEmbedder> FaceAlertProcessor<D, E> {
    pub fn new(detector: D, embedder: E, references: Arc<ReferenceStore>, threshold: f32) -> Self {
        Self {
            detector,
            embedder,
            references,
            threshold,
        }
    }
}

impl<D: RegionDetector, E: FaceEmbedder> FrameProcessor for FaceAlertProcessor<D, E> {
    fn name(&self) -> &'static str {
        "face"
    }

    fn process(&mut self, frame: &mut RgbImage) -> FrameReport {
        let mut report = FrameReport::default();

        let regions = match self.detector.detect_regions(frame) {
            Ok(regions) => regions,
            Err(e) => {
                tracing::warn!(error = %e, "face detection failed; frame passed through");
                report.detect_failed = true;
                return report;
            }
        };
        report.regions = regions.len();

        let references = self.references.snapshot();
        let mut colors = Vec::with_capacity(regions.len());

        // Embed every region before drawing so crops stay clean.
        for region in &regions {
            let embedding = match self.embedder.embed(frame, region) {
                Ok(embedding) => embedding,
                Err(e) => {
                    tracing::debug!(error = %e, "skipping region");
                    report.embed_failures += 1;
                    colors.push(FACE_COLOR);
                    continue;
                }
            };

            let matches = CosineMatcher.matches(&embedding, references.entries(), self.threshold);
            if matches.is_empty() {
                if let Some(best) = CosineMatcher.best(&embedding, references.entries()) {
                    tracing::debug!(label = %best.label, similarity = best.similarity, "closest reference below threshold");
                }
            }
            colors.push(if matches.is_empty() { FACE_COLOR } else { MATCH_COLOR });
            for m in matches {
                tracing::info!(label = %m.label, similarity = m.similarity, "match found");
                report.alerts.push(Alert::identity(&m.label));
            }
        }

        for (region, color) in regions.iter().zip(colors) {
            annotate::draw_box(frame, region, color);
        }
        report
    }
}

/// Weapon viewer pipeline: object detection with boxes and an alert for the
/// most confident hit.
///
/// The confidence threshold is re-read on every frame.
pub struct WeaponProcessor<D> {
    detector: D,
    class_names: Vec<String>,
    threshold: SharedThreshold,
}

impl<D: AdjustableDetector> WeaponProcessor<D> {
    pub fn new(detector: D, class_names: Vec<String>, threshold: SharedThreshold) -> Self {
        Self {
            detector,
            class_names,
            threshold,
        }
    }

    fn class_name(&self, class_id: usize) -> String {
        self.class_names
            .get(class_id)
            .cloned()
            .unwrap_or_else(|| format!("class {class_id}"))
    }
}

impl<D: AdjustableDetector> FrameProcessor for WeaponProcessor<D> {
    fn name(&self) -> &'static str {
        "weapon"
    }

    fn process(&mut self, frame: &mut RgbImage) -> FrameReport {
        let mut report = FrameReport::default();
        self.detector.set_confidence_threshold(self.threshold.get());
        let detections = match self.detector.detect_regions(frame) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "object detection failed; frame passed through");
                report.detect_failed = true;
                return report;
            }
        };
        report.regions = detections.len();

        for det in &detections {
            annotate::draw_box(frame, det, OBJECT_COLOR);
        }

        let strongest = detections.iter().max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if let Some(det) = strongest {
            let name = self.class_name(det.class_id);
            tracing::info!(class = %name, confidence = det.confidence, "object detected");
            let message = format!("ALERT: {name} detected ({:.2})", det.confidence);
            report.alerts.push(Alert::new(name, message));
        }
        report
    }
}
