use std::io::Cursor;

use image::{DynamicImage, ImageFormat, ImageReader, Limits, RgbImage};
use tracing::{debug, instrument};

use crate::vision::VisionError;

/// Allowed still-image formats - explicit allowlist
const ALLOWED_FORMATS: &[ImageFormat] = &[ImageFormat::Jpeg, ImageFormat::Png, ImageFormat::WebP];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb8,
    /// Canvas-style buffers; alpha is ignored.
    Rgba8,
}

impl PixelFormat {
    pub fn channels(self) -> usize {
        match self {
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 => 4,
        }
    }
}

/// A decoded frame handed over by the host (image element, video element,
/// or a decoded upload). Pixel data is row-major, interleaved.
#[derive(Debug, Clone)]
pub struct Frame {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl Frame {
    /// Wraps a pixel buffer. Zero-sized frames (media not loaded yet) are
    /// rejected with `InvalidFrame`.
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: Vec<u8>,
    ) -> Result<Self, VisionError> {
        if width == 0 || height == 0 {
            return Err(VisionError::InvalidFrame { width, height });
        }

        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|px| px.checked_mul(format.channels()))
            .ok_or(VisionError::InvalidFrame { width, height })?;

        if data.len() != expected {
            return Err(VisionError::InvalidPixelBuffer {
                expected,
                got: data.len(),
            });
        }

        Ok(Self {
            width,
            height,
            format,
            data,
        })
    }

    pub fn from_rgb_image(img: RgbImage) -> Result<Self, VisionError> {
        let (width, height) = img.dimensions();
        Self::new(width, height, PixelFormat::Rgb8, img.into_raw())
    }

    /// Solid-colour frame; handy for placeholders and tests.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Result<Self, VisionError> {
        let pixels = (width as usize).saturating_mul(height as usize);
        let data = rgb.iter().copied().cycle().take(pixels * 3).collect();
        Self::new(width, height, PixelFormat::Rgb8, data)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn natural_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// RGB view of the frame, dropping alpha when present.
    pub fn to_rgb_image(&self) -> Result<RgbImage, VisionError> {
        let invalid = || VisionError::InvalidFrame {
            width: self.width,
            height: self.height,
        };

        match self.format {
            PixelFormat::Rgb8 => {
                RgbImage::from_raw(self.width, self.height, self.data.clone()).ok_or_else(invalid)
            }
            PixelFormat::Rgba8 => {
                let rgb: Vec<u8> = self
                    .data
                    .chunks_exact(4)
                    .flat_map(|px| [px[0], px[1], px[2]])
                    .collect();
                RgbImage::from_raw(self.width, self.height, rgb).ok_or_else(invalid)
            }
        }
    }
}

// ============================================================================
// Still image decoding
// ============================================================================

#[derive(Clone, Debug)]
pub struct ImageLimits {
    pub max_input_bytes: usize,
    pub max_pixels: u64,
    pub max_dimension: u32,
    pub max_alloc_bytes: u64,
}

impl Default for ImageLimits {
    fn default() -> Self {
        Self {
            max_input_bytes: 20 * 1024 * 1024,
            max_pixels: 100_000_000,
            max_dimension: 15_000,
            max_alloc_bytes: 512 * 1024 * 1024,
        }
    }
}

/// Decodes an uploaded still image into a frame.
///
/// Checks run cheapest first: byte length, format allowlist, header
/// dimensions, and only then the full decode under allocation limits.
#[instrument(skip(raw_bytes), fields(input_size = raw_bytes.len()))]
pub fn decode_image(raw_bytes: &[u8], limits: &ImageLimits) -> Result<Frame, VisionError> {
    if raw_bytes.is_empty() {
        return Err(VisionError::EmptyInput);
    }

    if raw_bytes.len() > limits.max_input_bytes {
        return Err(VisionError::CompressedTooLarge {
            size: raw_bytes.len(),
            max: limits.max_input_bytes,
        });
    }

    let format = image::guess_format(raw_bytes).map_err(VisionError::Decode)?;
    if !ALLOWED_FORMATS.contains(&format) {
        return Err(VisionError::UnsupportedFormat(format!("{format:?}")));
    }

    let (width, height) = ImageReader::with_format(Cursor::new(raw_bytes), format)
        .into_dimensions()
        .map_err(VisionError::Decode)?;

    if width == 0 || height == 0 {
        return Err(VisionError::InvalidFrame { width, height });
    }

    let pixels = u64::from(width) * u64::from(height);
    if pixels > limits.max_pixels {
        return Err(VisionError::PixelCountTooLarge {
            width,
            height,
            max_pixels: limits.max_pixels,
        });
    }

    let mut decode_limits = Limits::default();
    decode_limits.max_image_width = Some(limits.max_dimension);
    decode_limits.max_image_height = Some(limits.max_dimension);
    decode_limits.max_alloc = Some(limits.max_alloc_bytes);

    let mut reader = ImageReader::with_format(Cursor::new(raw_bytes), format);
    reader.limits(decode_limits);
    let img: DynamicImage = reader.decode().map_err(VisionError::Decode)?;

    debug!(width, height, ?format, "still image decoded");
    Frame::from_rgb_image(img.to_rgb8())
}
