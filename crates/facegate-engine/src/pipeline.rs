//! Frame → face → template chain shared by enrollment and authentication,
//! plus the per-run context the worker hands to each pipeline.

use crate::decision::FrameVerdict;
use crate::engine::{EngineError, Outcome};
use facegate_core::{crop_face, normalize, FaceLocator, Rect, Sensitivity, Template};
use facegate_hw::{Frame, FrameSource};
use image::GrayImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Face search result for one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FaceScan {
    None,
    /// Ambiguous; the frame is skipped.
    Multiple(usize),
    Single { rect: Rect, template: Template },
}

/// Locate faces and, if exactly one is present, normalize it.
pub fn scan_frame(
    gray: &GrayImage,
    locator: &dyn FaceLocator,
    sensitivity: &Sensitivity,
) -> (Vec<Rect>, FaceScan) {
    let faces = locator.locate(gray, sensitivity);
    let scan = match faces.as_slice() {
        [] => FaceScan::None,
        [rect] => match normalize(&crop_face(gray, *rect)) {
            Ok(template) => FaceScan::Single {
                rect: *rect,
                template,
            },
            Err(e) => {
                tracing::warn!(error = %e, ?rect, "face region could not be normalized");
                FaceScan::None
            }
        },
        many => FaceScan::Multiple(many.len()),
    };
    (faces, scan)
}

/// Per-frame status carried alongside preview frames.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameStatus {
    Enrolling { captured: usize, target: usize },
    Authenticating(FrameVerdict),
}

/// Live preview event: the mirrored frame, detected faces and status.
#[derive(Clone)]
pub struct FrameEvent {
    pub frame: Frame,
    pub faces: Vec<Rect>,
    pub status: FrameStatus,
}

pub(crate) enum Poll {
    Frame(Frame),
    Stop(Outcome),
}

/// Everything a pipeline needs besides its frame source and store.
pub struct PipelineContext<'a> {
    pub locator: &'a dyn FaceLocator,
    pub sensitivity: Sensitivity,
    pub frame_interval: Duration,
    pub cancel: &'a AtomicBool,
    pub events: &'a mpsc::Sender<FrameEvent>,
}

impl PipelineContext<'_> {
    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Check for cancellation, then block for the next frame.
    pub(crate) fn poll(&self, source: &mut dyn FrameSource) -> Poll {
        if self.cancelled() {
            return Poll::Stop(Outcome::Cancelled);
        }
        match source.next_frame() {
            Ok(Some(frame)) => Poll::Frame(frame),
            Ok(None) => Poll::Stop(Outcome::Failed(EngineError::SourceExhausted)),
            Err(e) => {
                tracing::error!(error = %e, "frame capture failed");
                Poll::Stop(Outcome::Failed(e.into()))
            }
        }
    }

    /// Publish a preview event without ever blocking the pipeline.
    pub(crate) fn emit(&self, frame: Frame, faces: Vec<Rect>, status: FrameStatus) {
        if let Err(mpsc::error::TrySendError::Full(_)) =
            self.events.try_send(FrameEvent { frame, faces, status })
        {
            tracing::trace!("consumer lagging; preview frame dropped");
        }
    }

    pub(crate) fn pause(&self) {
        if !self.frame_interval.is_zero() {
            std::thread::sleep(self.frame_interval);
        }
    }
}
