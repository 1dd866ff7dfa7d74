use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use vigil_core::pipeline::EnrollError;
use vigil_core::reference::{ReferenceError, ReferenceInfo};
use vigil_core::{EmbedError, FaceDetector, FaceEmbedder, FaceRecognizer, ReferenceStore, RegionDetector};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detector error: {0}")]
    Detector(#[from] vigil_core::detector::DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] vigil_core::recognizer::RecognizerError),
    #[error(transparent)]
    Reference(#[from] ReferenceError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl EngineError {
    /// The photo held no face the models could use.
    pub fn is_no_face(&self) -> bool {
        matches!(
            self,
            Self::Reference(ReferenceError::Enroll(
                EnrollError::NoFaceDetected | EnrollError::Embed(EmbedError::NoUsableFace)
            ))
        )
    }

    /// The caller sent bad input (label).
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, Self::Reference(ReferenceError::Invalid(_)))
    }
}

/// Result of an enrollment.
#[derive(Debug, Clone)]
pub struct EnrollResult {
    pub label: String,
    pub references: Vec<ReferenceInfo>,
}

/// Messages sent from HTTP / D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        label: String,
        image: RgbImage,
        reply: oneshot::Sender<Result<EnrollResult, EngineError>>,
    },
}

/// Clone-safe handle to the enrollment thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Embed the best face in `image` and store it as `label`.
    pub async fn enroll(&self, label: String, image: RgbImage) -> Result<EnrollResult, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                label,
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Load the face models the enrollment engine needs.
pub fn load_face_models(
    scrfd_path: &str,
    arcface_path: &str,
) -> Result<(FaceDetector, FaceRecognizer), EngineError> {
    let detector = FaceDetector::load(scrfd_path)?;
    tracing::info!(path = scrfd_path, "SCRFD detector loaded");
    let recognizer = FaceRecognizer::load(arcface_path)?;
    tracing::info!(path = arcface_path, "ArcFace recognizer loaded");
    Ok((detector, recognizer))
}

/// Spawn the enrollment engine on a dedicated OS thread.
///
/// The thread owns its own detector and embedder so enrollment never
/// contends with the streaming loop for a model session.
pub fn spawn_engine<D, E>(
    mut detector: D,
    mut embedder: E,
    store: Arc<ReferenceStore>,
) -> Result<EngineHandle, EngineError>
where
    D: RegionDetector + Send + 'static,
    E: FaceEmbedder + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("vigil-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll { label, image, reply } => {
                        let result = run_enroll(&store, &label, &image, &mut detector, &mut embedder);
                        if let Err(e) = &result {
                            tracing::warn!(label = %label, error = %e, "enroll failed");
                        }
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_enroll<D: RegionDetector, E: FaceEmbedder>(
    store: &ReferenceStore,
    label: &str,
    image: &RgbImage,
    detector: &mut D,
    embedder: &mut E,
) -> Result<EnrollResult, EngineError> {
    let set = store.add(label, image, detector, embedder)?;
    tracing::info!(label, references = set.len(), "enrolled reference");
    Ok(EnrollResult {
        label: label.trim().to_string(),
        references: set.info(),
    })
}
