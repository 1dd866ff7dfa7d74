//! vigil-core — detection, recognition and reference matching.
//!
//! SCRFD finds faces, ArcFace embeds them and YOLOv8 finds objects, all via
//! ONNX Runtime on the CPU. Matches against the reference set are published
//! to consumers through the [`SharedStateSlot`].

pub mod alignment;
pub mod annotate;
pub mod detector;
pub mod object_detector;
pub mod pipeline;
pub mod recognizer;
pub mod reference;
pub mod slot;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

use std::path::PathBuf;

pub use detector::FaceDetector;
pub use object_detector::{DetectionParams, ObjectDetector};
pub use pipeline::{
    AdjustableDetector, EmbedError, FaceAlertProcessor, FaceEmbedder, FrameProcessor, FrameReport,
    RegionDetector, SharedThreshold, WeaponProcessor,
};
pub use recognizer::FaceRecognizer;
pub use reference::{ReferenceSet, ReferenceStore};
pub use slot::SharedStateSlot;
pub use types::{Alert, BoundingBox, CosineMatcher, Embedding, Matcher, Reference};

pub const FACE_DETECTOR_MODEL: &str = "det_10g.onnx";
pub const FACE_RECOGNIZER_MODEL: &str = "w600k_r50.onnx";
pub const WEAPON_MODEL: &str = "weapon.onnx";

/// Where models live when no directory is configured.
///
/// `$XDG_DATA_HOME/vigil/models`, falling back to `~/.local/share/vigil/models`,
/// then `/usr/share/vigil/models`.
pub fn default_model_dir() -> PathBuf {
    if let Some(data) = std::env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(data).join("vigil/models");
    }
    if let Some(home) = std::env::var_os("HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(home).join(".local/share/vigil/models");
    }
    PathBuf::from("/usr/share/vigil/models")
}
