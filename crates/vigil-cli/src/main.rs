use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use vigil_core::annotate::{self, OBJECT_COLOR};
use vigil_core::{DetectionParams, ObjectDetector};
use vigil_hw::{Camera, Frame, FrameSource, VideoSource};

#[derive(Parser)]
#[command(name = "vigil", about = "Vigil face alert and weapon detection CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a reference identity from a photo
    Add {
        /// Name to alert with (e.g., "alice")
        label: String,
        /// Photo containing the person's face
        image: PathBuf,
    },
    /// List reference identities
    List,
    /// Remove a reference identity
    Remove {
        label: String,
    },
    /// Print and clear the pending alert
    Alert,
    /// Start the stream
    Start,
    /// Stop the stream
    Stop,
    /// Show daemon status
    Status,
    /// Set the live weapon detection threshold
    Threshold {
        /// Minimum confidence in [0, 1]
        value: f64,
    },
    /// Run the weapon detector over an image, directory, or MJPEG file
    Detect {
        /// Image, image directory, .mjpeg file, camera index, or stream URL
        input: String,
        /// YOLO ONNX model
        #[arg(short, long)]
        model: Option<PathBuf>,
        /// Minimum confidence in [0, 1]
        #[arg(short, long, default_value_t = 0.5)]
        threshold: f32,
        /// Class ids to keep, comma separated
        #[arg(short, long, value_delimiter = ',', default_value = "0")]
        classes: Vec<usize>,
        /// Class names indexed by id, comma separated
        #[arg(long, value_delimiter = ',', default_value = "pistol")]
        names: Vec<String>,
        /// Write annotated frames here
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Stop after this many frames (needed for live sources)
        #[arg(long)]
        max_frames: Option<u64>,
        /// Give up after this many consecutive unreadable frames
        #[arg(long, default_value_t = 30)]
        max_read_failures: u32,
    },
    /// Run camera diagnostics
    Test {
        /// Device index or path
        #[arg(short, long, default_value = "0")]
        device: String,
        /// Where to write the captured frame
        #[arg(short, long, default_value = "vigil-test.jpg")]
        out: PathBuf,
    },
}

#[zbus::proxy(
    interface = "org.freedesktop.Vigil1",
    default_service = "org.freedesktop.Vigil1",
    default_path = "/org/freedesktop/Vigil1"
)]
trait Vigil {
    fn get_alert(&self) -> zbus::Result<String>;
    fn add_reference(&self, label: &str, image_path: &str) -> zbus::Result<String>;
    fn list_references(&self) -> zbus::Result<String>;
    fn remove_reference(&self, label: &str) -> zbus::Result<bool>;
    fn start_stream(&self) -> zbus::Result<bool>;
    fn stop_stream(&self) -> zbus::Result<bool>;
    fn status(&self) -> zbus::Result<String>;
    fn set_threshold(&self, threshold: f64) -> zbus::Result<f64>;
}

async fn daemon() -> Result<VigilProxy<'static>> {
    let conn = zbus::Connection::session()
        .await
        .context("cannot connect to the session bus")?;
    VigilProxy::new(&conn).await.context("vigild is not reachable over D-Bus")
}

fn print_json(raw: &str) {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(v) => println!("{}", serde_json::to_string_pretty(&v).unwrap_or_else(|_| raw.to_string())),
        Err(_) => println!("{raw}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Add { label, image } => {
            let image = std::fs::canonicalize(&image)
                .with_context(|| format!("cannot find {}", image.display()))?;
            let refs = daemon()
                .await?
                .add_reference(&label, &image.to_string_lossy())
                .await?;
            println!("Added reference {label}");
            print_json(&refs);
        }
        Commands::List => {
            let refs = daemon().await?.list_references().await?;
            let list: Vec<serde_json::Value> = serde_json::from_str(&refs).unwrap_or_default();
            if list.is_empty() {
                println!("No references");
            }
            for entry in list {
                println!("{}\t{}-d", entry["label"].as_str().unwrap_or("?"), entry["dim"]);
            }
        }
        Commands::Remove { label } => {
            if daemon().await?.remove_reference(&label).await? {
                println!("Removed {label}");
            } else {
                bail!("no reference named {label}");
            }
        }
        Commands::Alert => {
            let raw = daemon().await?.get_alert().await?;
            let value: serde_json::Value = serde_json::from_str(&raw).context("bad alert payload")?;
            match value["alert"].as_str() {
                Some(alert) => println!("{alert}"),
                None => println!("No alert"),
            }
        }
        Commands::Start => {
            let started = daemon().await?.start_stream().await?;
            println!("{}", if started { "Stream started" } else { "Stream already running" });
        }
        Commands::Stop => {
            let stopped = daemon().await?.stop_stream().await?;
            println!("{}", if stopped { "Stream stopped" } else { "Stream was not running" });
        }
        Commands::Status => {
            let status = daemon().await?.status().await?;
            print_json(&status);
        }
        Commands::Threshold { value } => {
            let applied = daemon().await?.set_threshold(value).await?;
            println!("Threshold set to {applied:.2}");
        }
        Commands::Detect {
            input,
            model,
            threshold,
            classes,
            names,
            out,
            max_frames,
            max_read_failures,
        } => {
            let model = model.unwrap_or_else(|| vigil_core::default_model_dir().join(vigil_core::WEAPON_MODEL));
            let options = DetectOptions {
                threshold,
                classes,
                names,
                out,
                max_frames,
                max_read_failures,
            };
            tokio::task::spawn_blocking(move || detect(&input, &model, options)).await??;
        }
        Commands::Test { device, out } => {
            tokio::task::spawn_blocking(move || test_camera(&device, &out)).await??;
        }
    }

    Ok(())
}

struct DetectOptions {
    threshold: f32,
    classes: Vec<usize>,
    names: Vec<String>,
    out: Option<PathBuf>,
    max_frames: Option<u64>,
    max_read_failures: u32,
}

/// Pull the next readable frame, skipping up to `max_failures` consecutive
/// read errors. `Ok(None)` at end of stream.
fn next_readable_frame<S: FrameSource + ?Sized>(source: &mut S, max_failures: u32) -> Result<Option<Frame>> {
    let mut failures = 0u32;
    loop {
        match source.next_frame() {
            Ok(frame) => return Ok(frame),
            Err(e) => {
                failures += 1;
                tracing::warn!(error = %e, failures, "skipping unreadable frame");
                if failures >= max_failures.max(1) {
                    bail!("{failures} consecutive read failures from {}: {e}", source.describe());
                }
            }
        }
    }
}

/// Offline weapon viewer: one JSON line per frame, optional annotated JPEGs.
fn detect(input: &str, model: &std::path::Path, options: DetectOptions) -> Result<()> {
    let DetectOptions {
        threshold,
        classes,
        names,
        out,
        max_frames,
        max_read_failures,
    } = options;
    if !(0.0..=1.0).contains(&threshold) {
        bail!("threshold must be within [0, 1]");
    }
    let params = DetectionParams {
        confidence_threshold: threshold,
        classes,
        ..Default::default()
    };
    let mut detector = ObjectDetector::load(&model.to_string_lossy(), params)
        .with_context(|| format!("failed to load {}", model.display()))?;

    let source: VideoSource = input.parse()?;
    let mut frames = source.open()?;
    if let Some(dir) = &out {
        std::fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
    }

    let mut processed = 0u64;
    while max_frames.map_or(true, |max| processed < max) {
        let Some(frame) = next_readable_frame(&mut frames, max_read_failures)? else {
            break;
        };
        let sequence = frame.sequence;
        let mut image = frame.into_image();
        let detections = detector.detect(&image)?;

        let rows: Vec<serde_json::Value> = detections
            .iter()
            .map(|d| {
                serde_json::json!({
                    "class_id": d.class_id,
                    "class": names.get(d.class_id).cloned().unwrap_or_else(|| format!("class {}", d.class_id)),
                    "confidence": d.confidence,
                    "box": [d.x, d.y, d.width, d.height],
                })
            })
            .collect();
        println!("{}", serde_json::json!({ "frame": sequence, "detections": rows }));

        if let Some(dir) = &out {
            for d in &detections {
                annotate::draw_box(&mut image, d, OBJECT_COLOR);
            }
            let path = dir.join(format!("frame_{sequence:05}.jpg"));
            std::fs::write(&path, annotate::encode_jpeg(&image, 90)?)
                .with_context(|| format!("cannot write {}", path.display()))?;
        }
        processed += 1;
    }

    eprintln!("{processed} frame(s) processed");
    Ok(())
}

/// Camera diagnostics without the daemon.
fn test_camera(device: &str, out: &std::path::Path) -> Result<()> {
    println!("Running camera diagnostics...");
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in &devices {
        println!("  {}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }

    let path = match device.parse::<VideoSource>()? {
        VideoSource::Camera(path) => path,
        other => bail!("{other} is not a camera"),
    };
    let mut camera = Camera::open(&path)?;
    println!(
        "Opened {} at {}x{} ({:?})",
        path,
        camera.width,
        camera.height,
        camera.pixel_format()
    );

    let frame = camera.capture_frame()?;
    std::fs::write(out, annotate::encode_jpeg(&frame.image, 90)?)
        .with_context(|| format!("cannot write {}", out.display()))?;
    println!("Captured frame {} -> {}", frame.sequence, out.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_hw::SourceError;

    /// Plays back a script of reads.
    struct ScriptedSource(std::collections::VecDeque<Result<Option<Frame>, SourceError>>);

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
            self.0.pop_front().unwrap_or(Ok(None))
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    fn read_error() -> Result<Option<Frame>, SourceError> {
        Err(SourceError::Read(std::io::Error::other("scripted")))
    }

    fn frame(sequence: u64) -> Result<Option<Frame>, SourceError> {
        Ok(Some(Frame::new(image::RgbImage::new(4, 4), sequence)))
    }

    #[test]
    fn test_skips_sporadic_read_failures() {
        let mut source = ScriptedSource(vec![read_error(), read_error(), frame(7)].into());
        let frame = next_readable_frame(&mut source, 3).unwrap().unwrap();
        assert_eq!(frame.sequence, 7);
        assert!(next_readable_frame(&mut source, 3).unwrap().is_none());
    }

    #[test]
    fn test_gives_up_after_consecutive_failures() {
        let mut source = ScriptedSource(std::iter::repeat_with(read_error).take(10).collect());
        let err = next_readable_frame(&mut source, 3).unwrap_err();
        assert!(err.to_string().contains("3 consecutive read failures"));
        assert_eq!(source.0.len(), 7);
    }
}
