use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Side length of a normalized face template, in pixels.
pub const TEMPLATE_SIZE: u32 = 100;

/// Axis-aligned face region in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Clamp the rectangle so it lies inside a `width`×`height` image.
    pub fn clamp_to(&self, width: u32, height: u32) -> Rect {
        let x = self.x.min(width);
        let y = self.y.min(height);
        Rect {
            x,
            y,
            width: self.width.min(width - x),
            height: self.height.min(height - y),
        }
    }
}

/// Identity label assigned by the model store. Never reused once issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A normalized `TEMPLATE_SIZE`×`TEMPLATE_SIZE` grayscale face sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pixels: Vec<u8>,
}

impl Template {
    /// Wrap raw row-major pixels; the buffer must be exactly template-sized.
    pub fn from_pixels(pixels: Vec<u8>) -> Result<Self, TemplateError> {
        let expected = (TEMPLATE_SIZE * TEMPLATE_SIZE) as usize;
        if pixels.len() != expected {
            return Err(TemplateError::InvalidSize {
                expected,
                actual: pixels.len(),
            });
        }
        Ok(Self { pixels })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Pixel at column `x`, row `y`.
    pub fn at(&self, x: u32, y: u32) -> u8 {
        self.pixels[(y * TEMPLATE_SIZE + x) as usize]
    }

    pub fn to_image(&self) -> GrayImage {
        // Length is checked at construction, so from_raw cannot fail.
        GrayImage::from_raw(TEMPLATE_SIZE, TEMPLATE_SIZE, self.pixels.clone())
            .unwrap_or_else(|| GrayImage::new(TEMPLATE_SIZE, TEMPLATE_SIZE))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("template must have {expected} pixels, got {actual}")]
    InvalidSize { expected: usize, actual: usize },
}

/// Classifier output for one probe template.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub label: Label,
    /// Histogram distance to the nearest stored template. Lower = more similar.
    pub score: f64,
}
