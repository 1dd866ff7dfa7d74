//! Stand-ins for cameras and ONNX models used by the daemon tests.

use crate::engine::EngineHandle;
use crate::state::AppState;
use crate::stream::{BoxedSource, LoopSettings, SourceFactory, StreamController};
use image::RgbImage;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use vigil_core::{
    BoundingBox, EmbedError, Embedding, FaceAlertProcessor, FaceEmbedder, ReferenceStore, SharedStateSlot,
    SharedThreshold,
};
use vigil_hw::{Frame, FrameSource, SourceError};

pub use vigil_core::testing::{region, FixedDetector};

/// `count` black frames, then end-of-stream.
pub struct FiniteSource {
    remaining: usize,
    sequence: u64,
}

impl FiniteSource {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: count,
            sequence: 0,
        }
    }
}

impl FrameSource for FiniteSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let frame = Frame::new(RgbImage::new(64, 48), self.sequence);
        self.sequence += 1;
        Ok(Some(frame))
    }

    fn describe(&self) -> String {
        "finite test source".into()
    }
}

/// Never ends; sleeps between frames like a camera would.
pub struct EndlessSource {
    pub interval: Duration,
    sequence: u64,
}

impl EndlessSource {
    pub fn new(interval: Duration) -> Self {
        Self { interval, sequence: 0 }
    }
}

impl FrameSource for EndlessSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        std::thread::sleep(self.interval);
        self.sequence += 1;
        Ok(Some(Frame::new(RgbImage::new(32, 32), self.sequence)))
    }

    fn describe(&self) -> String {
        "endless test source".into()
    }
}

/// Every read fails.
pub struct BrokenSource;

impl FrameSource for BrokenSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        Err(SourceError::Read(std::io::Error::other("scripted read failure")))
    }

    fn describe(&self) -> String {
        "broken test source".into()
    }
}

/// Returns scripted embeddings in call order, then cycles back to the start.
pub struct CyclingEmbedder {
    script: Vec<Embedding>,
    queue: VecDeque<Embedding>,
}

impl CyclingEmbedder {
    pub fn new(script: Vec<Embedding>) -> Self {
        Self {
            queue: script.iter().cloned().collect(),
            script,
        }
    }
}

impl FaceEmbedder for CyclingEmbedder {
    fn embed(&mut self, _frame: &RgbImage, _region: &BoundingBox) -> Result<Embedding, EmbedError> {
        if self.queue.is_empty() {
            self.queue = self.script.iter().cloned().collect();
        }
        self.queue.pop_front().ok_or(EmbedError::NoUsableFace)
    }
}

/// A small PNG image, encoded.
pub fn png_bytes() -> Vec<u8> {
    let mut out = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(RgbImage::new(16, 16))
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

/// Daemon state over `references`, with a one-frame face stream that never
/// sees a face.
pub fn app_state(
    references: Arc<ReferenceStore>,
    uploads_dir: &Path,
    engine: Option<EngineHandle>,
    threshold: Option<SharedThreshold>,
) -> AppState {
    let slot = Arc::new(SharedStateSlot::new());
    let processor = FaceAlertProcessor::new(
        FixedDetector::new(vec![]),
        CyclingEmbedder::new(vec![]),
        Arc::clone(&references),
        0.7,
    );
    let open: SourceFactory = Arc::new(|| Ok(Box::new(FiniteSource::new(1)) as BoxedSource));
    let stream = Arc::new(StreamController::new(
        Box::new(processor),
        open,
        "test",
        Arc::clone(&slot),
        LoopSettings {
            jpeg_quality: 80,
            max_read_failures: 3,
        },
    ));

    AppState {
        slot,
        references,
        engine,
        stream,
        threshold,
        uploads_dir: uploads_dir.to_path_buf(),
        poll_interval: Duration::from_millis(5),
    }
}
