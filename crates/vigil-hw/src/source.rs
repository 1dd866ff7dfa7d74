//! Frame sources and source selection.

use crate::camera::{Camera, CameraError};
use crate::frame::{Frame, FrameError};
use crate::mjpeg::MjpegSource;
use crate::sequence::ImageSequence;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Compressed video containers, which need a video decoder rather than an
/// image decoder.
const VIDEO_CONTAINERS: [&str; 7] = ["mp4", "m4v", "mov", "avi", "mkv", "webm", "wmv"];

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source not found: {0}")]
    NotFound(String),
    #[error("{0}: video containers are not supported; transcode to MJPEG (ffmpeg -i <in> -f mjpeg <out>.mjpeg)")]
    UnsupportedContainer(PathBuf),
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("stream read failed: {0}")]
    Read(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Ordered frames from a camera or a file.
///
/// `Ok(None)` is end-of-stream; an `Err` is a single failed read and the
/// caller may keep pulling.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        (**self).next_frame()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Where frames come from, parsed from one configuration string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoSource {
    /// V4L2 device path.
    Camera(String),
    /// MJPEG over HTTP(S).
    Http(String),
    /// Directory of still images, taken in file-name order.
    Directory(PathBuf),
    /// File of concatenated JPEG images.
    MjpegFile(PathBuf),
    /// One still image.
    Image(PathBuf),
}

impl FromStr for VideoSource {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(SourceError::NotFound("empty source".into()));
        }
        if s.chars().all(|c| c.is_ascii_digit()) {
            return Ok(Self::Camera(format!("/dev/video{s}")));
        }
        if s.starts_with("http://") || s.starts_with("https://") {
            return Ok(Self::Http(s.to_string()));
        }
        if s.starts_with("/dev/") {
            return Ok(Self::Camera(s.to_string()));
        }

        let path = Path::new(s);
        if path.is_dir() {
            return Ok(Self::Directory(path.to_path_buf()));
        }
        if !path.is_file() {
            return Err(SourceError::NotFound(s.to_string()));
        }
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if VIDEO_CONTAINERS.contains(&extension.as_str()) {
            return Err(SourceError::UnsupportedContainer(path.to_path_buf()));
        }
        Ok(if extension == "mjpeg" || extension == "mjpg" {
            Self::MjpegFile(path.to_path_buf())
        } else {
            Self::Image(path.to_path_buf())
        })
    }
}

impl fmt::Display for VideoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Camera(dev) => write!(f, "camera {dev}"),
            Self::Http(url) => write!(f, "stream {url}"),
            Self::Directory(p) => write!(f, "image directory {}", p.display()),
            Self::MjpegFile(p) => write!(f, "mjpeg file {}", p.display()),
            Self::Image(p) => write!(f, "image {}", p.display()),
        }
    }
}

impl VideoSource {
    /// Live sources never reach end-of-stream on their own.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Camera(_) | Self::Http(_))
    }

    /// Open the source. Failure here is fatal for whoever asked for frames.
    pub fn open(&self) -> Result<Box<dyn FrameSource + Send>, SourceError> {
        tracing::info!(source = %self, "opening frame source");
        Ok(match self {
            Self::Camera(dev) => Box::new(Camera::open(dev)?),
            Self::Http(url) => {
                let client = reqwest::blocking::Client::builder()
                    .connect_timeout(HTTP_CONNECT_TIMEOUT)
                    .timeout(None::<Duration>)
                    .build()?;
                let response = client.get(url).send()?.error_for_status()?;
                tracing::debug!(
                    content_type = ?response.headers().get(reqwest::header::CONTENT_TYPE),
                    "stream connected"
                );
                Box::new(MjpegSource::new(response, url.clone()))
            }
            Self::Directory(dir) => Box::new(ImageSequence::from_dir(dir)?),
            Self::MjpegFile(path) => {
                let file = File::open(path).map_err(|source| SourceError::Io {
                    path: path.clone(),
                    source,
                })?;
                Box::new(MjpegSource::new(BufReader::new(file), path.display().to_string()))
            }
            Self::Image(path) => Box::new(ImageSequence::single(path)),
        })
    }
}
