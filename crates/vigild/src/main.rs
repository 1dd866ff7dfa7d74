use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use vigil_core::{
    DetectionParams, FaceAlertProcessor, ObjectDetector, ReferenceStore, SharedStateSlot, SharedThreshold,
    WeaponProcessor,
};
use vigil_hw::VideoSource;

mod config;
mod dbus_interface;
mod engine;
mod http;
mod state;
mod stream;

#[cfg(test)]
mod testing;

use config::{Config, Pipeline};
use engine::EngineHandle;
use state::AppState;
use stream::{BoxedProcessor, BoxedSource, LoopSettings, SourceFactory, StreamController};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("vigild starting");

    let config = Config::load().context("failed to load configuration")?;
    tracing::info!(
        source = %config.source,
        pipeline = ?config.pipeline,
        model_dir = %config.model_dir.display(),
        reference_dir = %config.reference_dir.display(),
        "configuration loaded"
    );

    let references = Arc::new(
        ReferenceStore::open(&config.reference_dir).context("failed to open reference directory")?,
    );
    let slot = Arc::new(SharedStateSlot::new());

    let LoadedPipeline { processor, engine, threshold } = build_pipeline(&config, &references)?;

    let source = config.source.clone();
    let open: SourceFactory =
        Arc::new(move || -> Result<BoxedSource, vigil_hw::SourceError> { source.parse::<VideoSource>()?.open() });
    let stream = Arc::new(StreamController::new(
        processor,
        open,
        config.source.clone(),
        Arc::clone(&slot),
        LoopSettings {
            jpeg_quality: config.jpeg_quality,
            max_read_failures: config.max_read_failures,
        },
    ));

    let state = AppState {
        slot,
        references,
        engine,
        stream,
        threshold,
        uploads_dir: config.uploads_dir.clone(),
        poll_interval: Duration::from_millis(config.stream_poll_interval_ms.max(1)),
    };

    if config.autostart {
        state.start_stream().await.context("failed to start stream")?;
    }

    // Keep the connection alive for the lifetime of the daemon.
    let _dbus = if config.dbus_enabled {
        match serve_dbus(state.clone()).await {
            Ok(conn) => {
                tracing::info!(name = dbus_interface::BUS_NAME, "D-Bus interface registered");
                Some(conn)
            }
            Err(e) => {
                tracing::warn!(error = %e, "D-Bus unavailable; continuing with HTTP only");
                None
            }
        }
    } else {
        None
    };

    let listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;
    tracing::info!(addr = %config.http_addr, "vigild ready");

    axum::serve(listener, http::router(state.clone()))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("HTTP server failed")?;

    tracing::info!("vigild shutting down");
    state.stop_stream().await?;
    Ok(())
}

/// Processor plus the controls that come with it.
struct LoadedPipeline {
    processor: BoxedProcessor,
    engine: Option<EngineHandle>,
    threshold: Option<SharedThreshold>,
}

/// Load the models for the configured pipeline.
///
/// The face pipeline also drives the enrollment engine; the weapon pipeline
/// has no enrollment but a live confidence threshold.
fn build_pipeline(config: &Config, references: &Arc<ReferenceStore>) -> Result<LoadedPipeline> {
    match config.pipeline {
        Pipeline::Face => {
            let (detector, recognizer) =
                engine::load_face_models(&config.scrfd_model_path(), &config.arcface_model_path())
                    .context("failed to load face models")?;
            let processor = FaceAlertProcessor::new(
                detector,
                recognizer,
                Arc::clone(references),
                config.similarity_threshold,
            );

            // The engine gets its own sessions.
            let (detector, recognizer) =
                engine::load_face_models(&config.scrfd_model_path(), &config.arcface_model_path())
                    .context("failed to load face models for enrollment")?;
            let engine = engine::spawn_engine(detector, recognizer, Arc::clone(references))
                .context("failed to start enrollment engine")?;

            Ok(LoadedPipeline {
                processor: Box::new(processor),
                engine: Some(engine),
                threshold: None,
            })
        }
        Pipeline::Weapon => {
            let params = DetectionParams {
                confidence_threshold: config.confidence_threshold,
                classes: config.weapon_classes.clone(),
                ..Default::default()
            };
            let detector = ObjectDetector::load(&config.weapon_model_path(), params)
                .context("failed to load weapon model")?;
            let threshold = SharedThreshold::new(config.confidence_threshold);
            let processor =
                WeaponProcessor::new(detector, config.weapon_class_names.clone(), threshold.clone());
            Ok(LoadedPipeline {
                processor: Box::new(processor),
                engine: None,
                threshold: Some(threshold),
            })
        }
    }
}

async fn serve_dbus(state: AppState) -> Result<zbus::Connection> {
    let conn = zbus::connection::Builder::session()?
        .name(dbus_interface::BUS_NAME)?
        .serve_at(dbus_interface::OBJECT_PATH, dbus_interface::VigilService::new(state))?
        .build()
        .await?;
    Ok(conn)
}
