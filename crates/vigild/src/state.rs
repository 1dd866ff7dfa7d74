use crate::engine::EngineHandle;
use crate::stream::StreamController;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use vigil_core::reference::ReferenceError;
use vigil_core::{ReferenceStore, SharedStateSlot, SharedThreshold};

#[derive(Error, Debug, PartialEq)]
pub enum ThresholdError {
    #[error("threshold must be within [0, 1], got {0}")]
    OutOfRange(f32),
    #[error("the {0} pipeline has no adjustable threshold")]
    Unsupported(&'static str),
}

/// Everything the HTTP and D-Bus surfaces share.
#[derive(Clone)]
pub struct AppState {
    pub slot: Arc<SharedStateSlot>,
    pub references: Arc<ReferenceStore>,
    /// Present only when the face models loaded.
    pub engine: Option<EngineHandle>,
    pub stream: Arc<StreamController>,
    /// Live detection threshold; present only for the weapon pipeline.
    pub threshold: Option<SharedThreshold>,
    pub uploads_dir: PathBuf,
    pub poll_interval: Duration,
}

impl AppState {
    /// Pending alert message, cleared by this read.
    pub fn take_alert_json(&self) -> serde_json::Value {
        let alert = self.slot.read_and_clear_alert();
        serde_json::json!({ "alert": alert.map(|a| a.message) })
    }

    pub fn status_json(&self) -> serde_json::Value {
        let references = self.references.snapshot();
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "stream": self.stream.status(),
            "slot": self.slot.stats(),
            "references": references.len(),
            "reference_dim": references.dim(),
            "enrollment": self.engine.is_some(),
            "threshold": self.threshold.as_ref().map(SharedThreshold::get),
        })
    }

    /// Change the detection threshold of the running (or next) stream.
    pub fn set_threshold(&self, value: f32) -> Result<f32, ThresholdError> {
        let threshold = self
            .threshold
            .as_ref()
            .ok_or_else(|| ThresholdError::Unsupported(self.stream.status().pipeline))?;
        if !(0.0..=1.0).contains(&value) {
            return Err(ThresholdError::OutOfRange(value));
        }
        let applied = threshold.set(value);
        tracing::info!(threshold = applied, "detection threshold updated");
        Ok(applied)
    }

    /// Delete a reference off the async runtime. `Ok(false)` when `label`
    /// was not enrolled.
    pub async fn remove_reference(&self, label: String) -> Result<bool, ReferenceError> {
        let references = Arc::clone(&self.references);
        let dir = references.dir().to_path_buf();
        let removed = tokio::task::spawn_blocking(move || references.remove(&label))
            .await
            .map_err(|e| ReferenceError::Io {
                path: dir,
                source: std::io::Error::other(e),
            })?;
        match removed {
            Ok(_) => Ok(true),
            Err(ReferenceError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Start the stream without blocking the async runtime.
    pub async fn start_stream(&self) -> anyhow::Result<bool> {
        let stream = Arc::clone(&self.stream);
        Ok(tokio::task::spawn_blocking(move || stream.start()).await??)
    }

    /// Stop the stream without blocking the async runtime.
    pub async fn stop_stream(&self) -> anyhow::Result<bool> {
        let stream = Arc::clone(&self.stream);
        Ok(tokio::task::spawn_blocking(move || stream.stop()).await??)
    }
}
