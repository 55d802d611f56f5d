use image::imageops::{self, FilterType};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::VisionError;
use crate::frame::Frame;

/// Affine map between source-frame pixels and letterboxed model input.
///
/// `model = source * scale + pad`, so `source = (model - pad) / scale`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LetterboxTransform {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl LetterboxTransform {
    /// Fit a `width`x`height` frame inside the target, centered.
    pub fn fit(
        width: u32,
        height: u32,
        target_width: u32,
        target_height: u32,
    ) -> Result<Self, VisionError> {
        if width == 0 || height == 0 {
            return Err(VisionError::InvalidFrame { width, height });
        }
        if target_width == 0 || target_height == 0 {
            return Err(VisionError::InvalidFrame {
                width: target_width,
                height: target_height,
            });
        }

        let scale_w = target_width as f32 / width as f32;
        let scale_h = target_height as f32 / height as f32;
        let scale = scale_w.min(scale_h);

        if !scale.is_finite() || scale <= 0.0 {
            return Err(VisionError::InvalidFrame { width, height });
        }

        Ok(Self {
            scale,
            pad_x: (target_width as f32 - width as f32 * scale) / 2.0,
            pad_y: (target_height as f32 - height as f32 * scale) / 2.0,
        })
    }

    pub fn to_model(&self, x: f32, y: f32) -> (f32, f32) {
        (x * self.scale + self.pad_x, y * self.scale + self.pad_y)
    }

    pub fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Channel-first `[1, 3, H, W]` float tensor, values in `0.0..=1.0`.
#[derive(Debug, Clone)]
pub struct InputTensor {
    pub shape: [usize; 4],
    pub data: Vec<f32>,
}

impl InputTensor {
    pub fn width(&self) -> usize {
        self.shape[3]
    }

    pub fn height(&self) -> usize {
        self.shape[2]
    }
}

/// Letterboxes a frame into a `target_width`x`target_height` tensor.
///
/// The frame is resized preserving aspect ratio, centered on a black canvas
/// and split into R, G and B planes normalized by 255.
#[instrument(skip(frame), fields(width = frame.width(), height = frame.height()))]
pub fn preprocess(
    frame: &Frame,
    target_width: u32,
    target_height: u32,
) -> Result<(InputTensor, LetterboxTransform), VisionError> {
    let (orig_w, orig_h) = frame.natural_size();
    let transform = LetterboxTransform::fit(orig_w, orig_h, target_width, target_height)?;

    let new_w = ((orig_w as f32) * transform.scale).round() as u32;
    let new_h = ((orig_h as f32) * transform.scale).round() as u32;
    let new_w = new_w.clamp(1, target_width);
    let new_h = new_h.clamp(1, target_height);

    let rgb = frame.to_rgb_image()?;
    let resized = if (new_w, new_h) == (orig_w, orig_h) {
        rgb
    } else {
        imageops::resize(&rgb, new_w, new_h, FilterType::Triangle)
    };

    let th = target_height as usize;
    let tw = target_width as usize;
    let mut canvas = Array3::<f32>::zeros((3, th, tw));

    let offset_x = transform.pad_x.floor().max(0.0) as usize;
    let offset_y = transform.pad_y.floor().max(0.0) as usize;
    let rgb_raw = resized.as_raw();
    let rgb_width = new_w as usize;

    let copy_h = (new_h as usize).min(th - offset_y);
    let copy_w = rgb_width.min(tw - offset_x);

    for y in 0..copy_h {
        for x in 0..copy_w {
            let src_idx = (y * rgb_width + x) * 3;
            for c in 0..3 {
                canvas[[c, offset_y + y, offset_x + x]] = f32::from(rgb_raw[src_idx + c]) / 255.0;
            }
        }
    }

    let (data, _) = canvas.into_raw_vec_and_offset();

    Ok((
        InputTensor {
            shape: [1, 3, th, tw],
            data,
        },
        transform,
    ))
}
