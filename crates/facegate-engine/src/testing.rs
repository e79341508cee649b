//! Scripted camera and locator doubles for pipeline tests.

use crate::store::tests::textured;
use facegate_core::{FaceLocator, Rect, Sensitivity};
use facegate_hw::{CameraError, Frame, FrameSource, VideoDevice};
use image::GrayImage;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const FRAME_SIZE: u32 = 200;
/// Where every scripted face is drawn.
pub const FACE_RECT: Rect = Rect {
    x: 50,
    y: 50,
    width: 100,
    height: 100,
};

/// One scripted frame: how many faces the locator should report and which
/// texture to draw in the face region.
#[derive(Debug, Clone, Copy)]
pub struct FrameSpec {
    pub faces: u8,
    pub pattern: u32,
}

impl FrameSpec {
    pub fn face(pattern: u32) -> Self {
        Self { faces: 1, pattern }
    }

    pub fn empty() -> Self {
        Self {
            faces: 0,
            pattern: 0,
        }
    }

    pub fn crowd(pattern: u32, faces: u8) -> Self {
        Self { faces, pattern }
    }
}

/// Draw a frame. The face count is encoded in pixel (0, 0) for [`FakeLocator`].
pub fn render(spec: FrameSpec, sequence: u32) -> Frame {
    let texture = textured(spec.pattern);
    let mut data = Vec::with_capacity((FRAME_SIZE * FRAME_SIZE * 3) as usize);
    for y in 0..FRAME_SIZE {
        for x in 0..FRAME_SIZE {
            let v = if (x, y) == (0, 0) {
                spec.faces * 50
            } else if (FACE_RECT.x..FACE_RECT.x + FACE_RECT.width).contains(&x)
                && (FACE_RECT.y..FACE_RECT.y + FACE_RECT.height).contains(&y)
            {
                texture.at(x - FACE_RECT.x, y - FACE_RECT.y)
            } else {
                128
            };
            data.extend_from_slice(&[v, v, v]);
        }
    }
    Frame::from_rgb(data, FRAME_SIZE, FRAME_SIZE, sequence).unwrap()
}

pub struct FakeLocator;

impl FaceLocator for FakeLocator {
    fn locate(&self, frame: &GrayImage, _sensitivity: &Sensitivity) -> Vec<Rect> {
        let faces = (frame.get_pixel(0, 0)[0] as u32 + 25) / 50;
        (0..faces)
            .map(|i| Rect::new(FACE_RECT.x + i * 10, FACE_RECT.y, FACE_RECT.width, FACE_RECT.height))
            .collect()
    }
}

/// Plays a frame script, optionally on a loop.
pub struct ScriptedDevice {
    pub script: Vec<FrameSpec>,
    pub looping: bool,
    pub fail_open: bool,
    open_sources: Arc<AtomicUsize>,
}

impl ScriptedDevice {
    fn new(script: Vec<FrameSpec>, looping: bool, fail_open: bool) -> Self {
        Self {
            script,
            looping,
            fail_open,
            open_sources: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn once(script: Vec<FrameSpec>) -> Self {
        Self::new(script, false, false)
    }

    pub fn looping(script: Vec<FrameSpec>) -> Self {
        Self::new(script, true, false)
    }

    pub fn broken() -> Self {
        Self::new(Vec::new(), false, true)
    }

    /// Live count of sources opened from this device and not yet dropped.
    pub fn open_sources(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.open_sources)
    }
}

impl VideoDevice for ScriptedDevice {
    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
        if self.fail_open {
            return Err(CameraError::DeviceNotFound("/dev/scripted".into()));
        }
        self.open_sources.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSource {
            script: self.script.clone(),
            looping: self.looping,
            position: 0,
            sequence: 0,
            open_sources: Arc::clone(&self.open_sources),
        }))
    }

    fn describe(&self) -> String {
        format!("scripted ({} frames)", self.script.len())
    }
}

struct ScriptedSource {
    script: Vec<FrameSpec>,
    looping: bool,
    position: usize,
    sequence: u32,
    open_sources: Arc<AtomicUsize>,
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        self.open_sources.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FrameSource for ScriptedSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        if self.position >= self.script.len() {
            if !self.looping || self.script.is_empty() {
                return Ok(None);
            }
            self.position = 0;
        }
        let frame = render(self.script[self.position], self.sequence);
        self.position += 1;
        self.sequence += 1;
        Ok(Some(frame))
    }
}
