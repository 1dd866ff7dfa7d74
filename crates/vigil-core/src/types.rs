use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Axis-aligned detection box in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Model class index; always 0 for face detections.
    pub class_id: usize,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }

    /// Integer pixel rectangle `(x, y, w, h)` clipped to a `width`×`height` frame.
    ///
    /// Returns `None` when nothing of the box lies inside the frame.
    pub fn clip_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0).floor() as u32;
        let y0 = self.y.max(0.0).floor() as u32;
        let x1 = ((self.x + self.width).ceil().max(0.0) as u32).min(width);
        let y1 = ((self.y + self.height).ceil().max(0.0) as u32).min(height);
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }
}

/// Greedy non-maximum suppression; output is sorted by descending confidence.
pub fn non_max_suppression(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        let overlaps = kept
            .iter()
            .any(|k| k.class_id == candidate.class_id && k.iou(&candidate) > iou_threshold);
        if !overlaps {
            kept.push(candidate);
        }
    }
    kept
}

/// Feature vector for a face or object (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "w600k_r50"), when known.
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Zero-norm inputs score 0.0.
    ///
    /// Magnitude does not matter: `a.similarity(&(2.0 * a)) == 1.0`.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let (dot, norm_a, norm_b) = self.values.iter().zip(other.values.iter()).fold(
            (0.0f32, 0.0f32, 0.0f32),
            |(dot, na, nb), (a, b)| (dot + a * b, na + a * a, nb + b * b),
        );

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }
}

/// A labeled reference identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reference {
    pub label: String,
    pub embedding: Embedding,
}

/// One reference that a query matched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Match {
    pub label: String,
    /// Cosine similarity in [-1, 1].
    pub similarity: f32,
}

/// Transient alert held in the shared state slot until read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub label: String,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(label: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            message: message.into(),
            raised_at: Utc::now(),
        }
    }

    /// Alert for a recognized identity.
    pub fn identity(label: &str) -> Self {
        Self::new(label, format!("ALERT: {label} detected!"))
    }
}

/// Strategy for comparing a query embedding against the reference set.
pub trait Matcher {
    /// Every reference scoring strictly above `threshold`, in reference order.
    fn matches(&self, query: &Embedding, references: &[Reference], threshold: f32) -> Vec<Match>;

    /// Highest-scoring reference regardless of threshold.
    fn best(&self, query: &Embedding, references: &[Reference]) -> Option<Match>;
}

/// Cosine similarity matcher.
///
/// Visits every reference on every call; the set is expected to hold tens of
/// entries, so there is no index.
pub struct CosineMatcher;

impl CosineMatcher {
    fn scores<'a>(
        query: &'a Embedding,
        references: &'a [Reference],
    ) -> impl Iterator<Item = Match> + 'a {
        references
            .iter()
            .filter(move |r| {
                let comparable = r.embedding.dim() == query.dim();
                if !comparable {
                    tracing::debug!(
                        label = %r.label,
                        reference_dim = r.embedding.dim(),
                        query_dim = query.dim(),
                        "skipping reference with mismatched dimension"
                    );
                }
                comparable
            })
            .map(move |r| Match {
                label: r.label.clone(),
                similarity: query.similarity(&r.embedding),
            })
    }
}

impl Matcher for CosineMatcher {
    fn matches(&self, query: &Embedding, references: &[Reference], threshold: f32) -> Vec<Match> {
        Self::scores(query, references)
            .inspect(|m| tracing::trace!(label = %m.label, similarity = m.similarity, "similarity"))
            .filter(|m| m.similarity > threshold)
            .collect()
    }

    fn best(&self, query: &Embedding, references: &[Reference]) -> Option<Match> {
        Self::scores(query, references).fold(None, |best: Option<Match>, m| match best {
            Some(b) if b.similarity >= m.similarity => Some(b),
            _ => Some(m),
        })
    }
}
