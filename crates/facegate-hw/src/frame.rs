//! Frame type and pixel-format conversion — YUYV/GREY/Y16 to RGB, mirroring.

use image::{GrayImage, RgbImage};

/// A captured color camera frame, already mirrored into selfie orientation.
#[derive(Clone)]
pub struct Frame {
    /// Packed RGB8 pixels.
    pub image: RgbImage,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    /// Wrap packed RGB8 data (`width * height * 3` bytes).
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Result<Self, FrameError> {
        let expected = (width * height * 3) as usize;
        let actual = data.len();
        let image = RgbImage::from_raw(width, height, data)
            .ok_or(FrameError::InvalidLength { expected, actual })?;
        Ok(Self {
            image,
            timestamp: std::time::Instant::now(),
            sequence,
        })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Flip horizontally so the user sees a mirror image.
    pub fn mirrored(mut self) -> Self {
        image::imageops::flip_horizontal_in_place(&mut self.image);
        self
    }

    /// Luma conversion used by detection and normalization.
    pub fn to_grayscale(&self) -> GrayImage {
        image::imageops::grayscale(&self.image)
    }

    /// Average luma brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let gray = self.to_grayscale();
        let raw = gray.as_raw();
        if raw.is_empty() {
            return 0.0;
        }
        raw.iter().map(|&b| b as f32).sum::<f32>() / raw.len() as f32
    }
}

/// Convert packed YUYV (4:2:2) to RGB8 using BT.601 limited-range coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (y as f32 - 16.0) * 1.164;
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;
    let r = c + 1.596 * e;
    let g = c - 0.392 * d - 0.813 * e;
    let b = c + 2.017 * d;
    [
        r.round().clamp(0.0, 255.0) as u8,
        g.round().clamp(0.0, 255.0) as u8,
        b.round().clamp(0.0, 255.0) as u8,
    ]
}

/// Replicate an 8-bit grayscale buffer into RGB8.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = (width * height) as usize;
    if gray.len() < pixels {
        return Err(FrameError::InvalidLength {
            expected: pixels,
            actual: gray.len(),
        });
    }
    Ok(gray[..pixels].iter().flat_map(|&p| [p, p, p]).collect())
}

/// Downscale 16-bit little-endian grayscale to 8-bit by keeping the high byte.
pub fn y16_to_grey(buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = (width * height) as usize;
    let expected = pixels * 2;
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(buf[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_rgb_neutral_chroma() {
        // Y=16 is black and Y=235 is white when chroma is neutral.
        let yuyv = vec![16, 128, 235, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb.len(), 6);
        assert_eq!(&rgb[..3], &[0, 0, 0]);
        assert_eq!(&rgb[3..], &[255, 255, 255]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let yuyv = vec![100, 128]; // too short for 2x1
        assert!(yuyv_to_rgb(&yuyv, 2, 1).is_err());
    }

    #[test]
    fn test_grey_to_rgb_replicates() {
        let rgb = grey_to_rgb(&[7, 200], 2, 1).unwrap();
        assert_eq!(rgb, vec![7, 7, 7, 200, 200, 200]);
    }

    #[test]
    fn test_y16_keeps_high_byte() {
        // 0x12AB little-endian = [0xAB, 0x12]
        let gray = y16_to_grey(&[0xAB, 0x12, 0x00, 0xFF], 2, 1).unwrap();
        assert_eq!(gray, vec![0x12, 0xFF]);
    }

    #[test]
    fn test_mirrored_flips_columns() {
        // 2x1 frame: red pixel then blue pixel
        let frame = Frame::from_rgb(vec![255, 0, 0, 0, 0, 255], 2, 1, 0).unwrap();
        let mirrored = frame.mirrored();
        assert_eq!(mirrored.image.get_pixel(0, 0).0, [0, 0, 255]);
        assert_eq!(mirrored.image.get_pixel(1, 0).0, [255, 0, 0]);
    }

    #[test]
    fn test_from_rgb_rejects_short_buffer() {
        let err = Frame::from_rgb(vec![0; 5], 2, 1, 0).err().unwrap();
        assert!(matches!(err, FrameError::InvalidLength { expected: 6, actual: 5 }));
    }

    #[test]
    fn test_avg_brightness_uniform() {
        let frame = Frame::from_rgb(vec![128; 4 * 4 * 3], 4, 4, 0).unwrap();
        assert!((frame.avg_brightness() - 128.0).abs() < 1.0);
    }
}
