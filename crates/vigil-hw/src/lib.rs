//! vigil-hw — Frame capture for the streaming loop.
//!
//! V4L2 cameras, MJPEG files and HTTP streams, and still-image sequences,
//! all delivered as RGB [`Frame`]s through the [`FrameSource`] trait.

pub mod camera;
pub mod frame;
pub mod mjpeg;
pub mod sequence;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use source::{FrameSource, SourceError, VideoSource};
