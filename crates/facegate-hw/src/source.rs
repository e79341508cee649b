//! Device and frame-stream abstractions used by the capture pipelines.

use crate::camera::CameraError;
use crate::frame::Frame;

/// An open, streaming camera handle.
///
/// Dropping the source releases the underlying device. Sources are opened
/// and consumed on the worker thread, so they need not be `Send`.
pub trait FrameSource {
    /// Block until the next mirrored frame is available.
    ///
    /// Returns `Ok(None)` once the source is exhausted and will produce no
    /// further frames.
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError>;
}

/// A camera that can be opened on demand, once per pipeline run.
pub trait VideoDevice: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError>;

    /// Human-readable identifier for logs.
    fn describe(&self) -> String;
}
