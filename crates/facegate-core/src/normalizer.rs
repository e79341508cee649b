//! Face sample normalization: crop, resize, equalize, blur.
//!
//! Produces the fixed-size templates used for both training and inference.
//! Every step is deterministic, so identical regions always yield identical
//! templates.

use crate::types::{Rect, Template, TemplateError, TEMPLATE_SIZE};
use image::imageops::{self, FilterType};
use image::GrayImage;
use imageproc::contrast::equalize_histogram;
use imageproc::filter::gaussian_blur_f32;
use thiserror::Error;

/// Gaussian sigma matching a 5×5 kernel with automatic sigma selection
/// (0.3·((5−1)·0.5 − 1) + 0.8).
const BLUR_SIGMA: f32 = 1.1;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("face region is empty ({width}x{height})")]
    EmptyRegion { width: u32, height: u32 },
    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Cut a face region out of a grayscale frame, clamping it to the frame bounds.
pub fn crop_face(frame: &GrayImage, rect: Rect) -> GrayImage {
    let r = rect.clamp_to(frame.width(), frame.height());
    imageops::crop_imm(frame, r.x, r.y, r.width, r.height).to_image()
}

/// Normalize a grayscale face region into a training/inference template.
pub fn normalize(region: &GrayImage) -> Result<Template, NormalizeError> {
    let (width, height) = region.dimensions();
    if width == 0 || height == 0 {
        return Err(NormalizeError::EmptyRegion { width, height });
    }

    let resized = imageops::resize(region, TEMPLATE_SIZE, TEMPLATE_SIZE, FilterType::Triangle);
    let equalized = equalize_histogram(&resized);
    let blurred = gaussian_blur_f32(&equalized, BLUR_SIGMA);

    Ok(Template::from_pixels(blurred.into_raw())?)
}
