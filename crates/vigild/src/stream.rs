//! Streaming loop: frames in, annotated JPEGs and alerts out.
//!
//! One OS thread per running stream. The thread owns the frame processor
//! while it runs and hands it back on exit, so a stopped stream restarts
//! without reloading models.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use vigil_core::annotate;
use vigil_core::{FrameProcessor, SharedStateSlot};
use vigil_hw::{FrameSource, SourceError};

pub type BoxedProcessor = Box<dyn FrameProcessor + Send>;
pub type BoxedSource = Box<dyn FrameSource + Send>;

/// Opens a fresh source for each run.
pub type SourceFactory = Arc<dyn Fn() -> Result<BoxedSource, SourceError> + Send + Sync>;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("frame processor was lost when the stream thread panicked")]
    ProcessorLost,
    #[error("failed to spawn stream thread: {0}")]
    Spawn(std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    Starting,
    Running,
    Stopped,
}

/// Per-run counters.
#[derive(Debug, Default, Clone, Serialize)]
pub struct LoopStats {
    pub frames: u64,
    pub regions: u64,
    pub embed_failures: u64,
    pub detect_failures: u64,
    pub read_failures: u64,
    pub alerts: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct LoopSettings {
    pub jpeg_quality: u8,
    pub max_read_failures: u32,
}

#[derive(Debug)]
struct Progress {
    state: LoopState,
    transitions: Vec<LoopState>,
    stats: LoopStats,
    last_error: Option<String>,
}

/// State shared between one loop thread and its observers.
#[derive(Debug)]
pub struct LoopShared {
    stop: AtomicBool,
    progress: Mutex<Progress>,
}

impl Default for LoopShared {
    fn default() -> Self {
        Self {
            stop: AtomicBool::new(false),
            progress: Mutex::new(Progress {
                state: LoopState::Starting,
                transitions: vec![LoopState::Starting],
                stats: LoopStats::default(),
                last_error: None,
            }),
        }
    }
}

impl LoopShared {
    /// A finished run that never started; what status shows before the first start.
    fn idle() -> Self {
        let shared = Self::default();
        {
            let mut p = shared.progress.lock();
            p.state = LoopState::Stopped;
            p.transitions = vec![LoopState::Stopped];
        }
        shared
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> LoopState {
        self.progress.lock().state
    }

    /// Every state the loop has entered, in order.
    pub fn transitions(&self) -> Vec<LoopState> {
        self.progress.lock().transitions.clone()
    }

    pub fn stats(&self) -> LoopStats {
        self.progress.lock().stats.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.progress.lock().last_error.clone()
    }

    fn enter(&self, state: LoopState) {
        let mut p = self.progress.lock();
        if p.state != state {
            p.state = state;
            p.transitions.push(state);
        }
    }

    fn fail(&self, error: String) {
        self.progress.lock().last_error = Some(error);
    }
}

/// Run one stream to completion on the calling thread.
///
/// Returns when the source ends, fails to open, keeps failing to read, or a
/// stop is requested. The source is dropped before the state becomes `Stopped`.
pub fn run_loop<P>(
    open: impl FnOnce() -> Result<BoxedSource, SourceError>,
    processor: &mut P,
    slot: &SharedStateSlot,
    shared: &LoopShared,
    settings: LoopSettings,
) where
    P: FrameProcessor + ?Sized,
{
    shared.enter(LoopState::Starting);
    let mut source = match open() {
        Ok(source) => source,
        Err(e) => {
            tracing::error!(error = %e, "failed to open frame source");
            shared.fail(e.to_string());
            shared.enter(LoopState::Stopped);
            return;
        }
    };

    tracing::info!(source = %source.describe(), pipeline = processor.name(), "stream running");
    shared.enter(LoopState::Running);

    let mut consecutive_failures = 0u32;
    loop {
        if shared.stop_requested() {
            tracing::info!("stop requested");
            break;
        }

        let frame = match source.next_frame() {
            Ok(Some(frame)) => {
                consecutive_failures = 0;
                frame
            }
            Ok(None) => {
                tracing::info!("end of stream");
                break;
            }
            Err(e) => {
                consecutive_failures += 1;
                shared.progress.lock().stats.read_failures += 1;
                tracing::warn!(error = %e, consecutive_failures, "frame read failed");
                if consecutive_failures >= settings.max_read_failures {
                    tracing::error!(consecutive_failures, "too many failed reads; stopping stream");
                    shared.fail(format!("{consecutive_failures} consecutive read failures: {e}"));
                    break;
                }
                continue;
            }
        };

        let mut image = frame.into_image();
        let report = processor.process(&mut image);

        let jpeg = match annotate::encode_jpeg(&image, settings.jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                tracing::warn!(error = %e, "dropping frame");
                continue;
            }
        };

        let alert_count = report.alerts.len() as u64;
        // Later alerts overwrite earlier ones; only the last survives.
        let alert = report.alerts.into_iter().last();
        slot.write(jpeg, alert);

        let mut p = shared.progress.lock();
        p.stats.frames += 1;
        p.stats.regions += report.regions as u64;
        p.stats.embed_failures += report.embed_failures as u64;
        p.stats.detect_failures += u64::from(report.detect_failed);
        p.stats.alerts += alert_count;
    }

    drop(source);
    shared.enter(LoopState::Stopped);
    tracing::info!(stats = ?shared.stats(), "stream stopped");
}

/// A running loop thread.
pub struct LoopHandle {
    shared: Arc<LoopShared>,
    thread: JoinHandle<BoxedProcessor>,
}

impl LoopHandle {
    pub fn shared(&self) -> &Arc<LoopShared> {
        &self.shared
    }

    /// The loop has left `Running`; the thread is exiting or gone.
    pub fn is_finished(&self) -> bool {
        self.shared.state() == LoopState::Stopped || self.thread.is_finished()
    }

    /// Ask the loop to stop and wait for it; returns the processor.
    pub fn stop(self) -> Result<BoxedProcessor, StreamError> {
        self.shared.request_stop();
        self.join()
    }

    fn join(self) -> Result<BoxedProcessor, StreamError> {
        self.thread.join().map_err(|_| {
            tracing::error!("stream thread panicked");
            StreamError::ProcessorLost
        })
    }
}

/// Start `run_loop` on its own thread.
pub fn spawn_stream(
    open: SourceFactory,
    mut processor: BoxedProcessor,
    slot: Arc<SharedStateSlot>,
    settings: LoopSettings,
) -> Result<LoopHandle, StreamError> {
    let shared = Arc::new(LoopShared::default());
    let thread_shared = Arc::clone(&shared);

    let thread = std::thread::Builder::new()
        .name("vigil-stream".into())
        .spawn(move || {
            run_loop(|| open(), &mut processor, &slot, &thread_shared, settings);
            processor
        })
        .map_err(StreamError::Spawn)?;

    Ok(LoopHandle { shared, thread })
}

/// JSON-friendly snapshot of the stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub state: LoopState,
    pub pipeline: &'static str,
    pub source: String,
    pub stats: LoopStats,
    pub last_error: Option<String>,
    /// States the current run has passed through.
    pub transitions: Vec<LoopState>,
}

enum Control {
    Idle(Option<BoxedProcessor>),
    Running(LoopHandle),
}

/// Starts and stops the streaming loop, keeping the processor between runs.
pub struct StreamController {
    control: Mutex<Control>,
    /// Shared state of the current or most recent run.
    current: RwLock<Arc<LoopShared>>,
    open: SourceFactory,
    slot: Arc<SharedStateSlot>,
    settings: LoopSettings,
    pipeline: &'static str,
    source_name: String,
}

impl StreamController {
    pub fn new(
        processor: BoxedProcessor,
        open: SourceFactory,
        source_name: impl Into<String>,
        slot: Arc<SharedStateSlot>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            pipeline: processor.name(),
            control: Mutex::new(Control::Idle(Some(processor))),
            current: RwLock::new(Arc::new(LoopShared::idle())),
            open,
            slot,
            settings,
            source_name: source_name.into(),
        }
    }

    /// Start streaming. Returns `false` if a loop is already running.
    ///
    /// A loop that ended on its own (end of file, open failure) is reaped first.
    /// Blocks while reaping; call from `spawn_blocking` in async code.
    pub fn start(&self) -> Result<bool, StreamError> {
        let mut control = self.control.lock();
        let processor = match std::mem::replace(&mut *control, Control::Idle(None)) {
            Control::Running(handle) if !handle.is_finished() => {
                *control = Control::Running(handle);
                return Ok(false);
            }
            Control::Running(handle) => handle.join()?,
            Control::Idle(Some(processor)) => processor,
            Control::Idle(None) => return Err(StreamError::ProcessorLost),
        };

        let handle = spawn_stream(
            Arc::clone(&self.open),
            processor,
            Arc::clone(&self.slot),
            self.settings,
        )?;
        *self.current.write() = Arc::clone(handle.shared());
        *control = Control::Running(handle);
        tracing::info!(source = %self.source_name, "stream started");
        Ok(true)
    }

    /// Stop streaming and wait for the thread. Returns `false` if nothing was running.
    ///
    /// Blocks until the current frame finishes.
    pub fn stop(&self) -> Result<bool, StreamError> {
        let mut control = self.control.lock();
        match std::mem::replace(&mut *control, Control::Idle(None)) {
            Control::Running(handle) => {
                let was_running = !handle.is_finished();
                let processor = handle.stop()?;
                *control = Control::Idle(Some(processor));
                Ok(was_running)
            }
            idle => {
                *control = idle;
                Ok(false)
            }
        }
    }

    pub fn state(&self) -> LoopState {
        self.current.read().state()
    }

    pub fn status(&self) -> StreamStatus {
        let shared = Arc::clone(&self.current.read());
        StreamStatus {
            state: shared.state(),
            pipeline: self.pipeline,
            source: self.source_name.clone(),
            stats: shared.stats(),
            last_error: shared.last_error(),
            transitions: shared.transitions(),
        }
    }
}
