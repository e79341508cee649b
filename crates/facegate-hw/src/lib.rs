//! facegate-hw — Hardware abstraction for camera capture.
//!
//! Provides V4L2-based camera access behind the [`VideoDevice`] /
//! [`FrameSource`] traits, plus pixel-format conversion into mirrored RGB
//! frames.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat, V4lDevice};
pub use frame::Frame;
pub use source::{FrameSource, VideoDevice};
