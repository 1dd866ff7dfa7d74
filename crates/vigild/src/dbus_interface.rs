use crate::engine::EngineError;
use crate::state::{AppState, ThresholdError};
use vigil_core::reference::{validate_upload, ReferenceError};
use zbus::interface;

pub const BUS_NAME: &str = "org.freedesktop.Vigil1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Vigil1";

/// D-Bus interface for the Vigil daemon.
///
/// Bus name: org.freedesktop.Vigil1
/// Object path: /org/freedesktop/Vigil1
pub struct VigilService {
    state: AppState,
}

impl VigilService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

fn enroll_error(e: EngineError) -> zbus::fdo::Error {
    if e.is_no_face() || e.is_invalid_input() {
        zbus::fdo::Error::InvalidArgs(e.to_string())
    } else {
        zbus::fdo::Error::Failed(e.to_string())
    }
}

#[interface(name = "org.freedesktop.Vigil1")]
impl VigilService {
    /// Take the pending alert as JSON `{"alert": string|null}`.
    async fn get_alert(&self) -> String {
        self.state.take_alert_json().to_string()
    }

    /// Enroll `label` from an image file readable by the daemon.
    async fn add_reference(&self, label: &str, image_path: &str) -> zbus::fdo::Result<String> {
        tracing::info!(label, image_path, "add_reference requested");
        let label = validate_upload(label, Some(image_path))
            .map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?
            .to_string();
        let engine = self
            .state
            .engine
            .clone()
            .ok_or_else(|| zbus::fdo::Error::NotSupported("face enrollment is not available".into()))?;

        let path = image_path.to_string();
        let image = tokio::task::spawn_blocking(move || image::open(&path).map(|i| i.to_rgb8()))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("cannot read {image_path}: {e}")))?;

        let result = engine.enroll(label, image).await.map_err(enroll_error)?;
        serde_json::to_string(&result.references).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// JSON array of `{label, dim}`.
    async fn list_references(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.state.references.list())
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    async fn remove_reference(&self, label: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(label, "remove_reference requested");
        match self.state.remove_reference(label.to_string()).await {
            Ok(removed) => Ok(removed),
            Err(ReferenceError::Invalid(e)) => Err(zbus::fdo::Error::InvalidArgs(e.to_string())),
            Err(e) => Err(zbus::fdo::Error::Failed(e.to_string())),
        }
    }

    /// Set the live detection threshold; returns the value applied.
    async fn set_threshold(&self, threshold: f64) -> zbus::fdo::Result<f64> {
        match self.state.set_threshold(threshold as f32) {
            Ok(applied) => Ok(f64::from(applied)),
            Err(e @ ThresholdError::OutOfRange(_)) => Err(zbus::fdo::Error::InvalidArgs(e.to_string())),
            Err(e @ ThresholdError::Unsupported(_)) => Err(zbus::fdo::Error::NotSupported(e.to_string())),
        }
    }

    async fn start_stream(&self) -> zbus::fdo::Result<bool> {
        self.state
            .start_stream()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    async fn stop_stream(&self) -> zbus::fdo::Result<bool> {
        self.state
            .stop_stream()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Return daemon status information.
    async fn status(&self) -> String {
        self.state.status_json().to_string()
    }
}
