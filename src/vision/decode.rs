use ndarray::{ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{Detection, LetterboxTransform, OutputTensor, VisionError};
use crate::config::{AnchorSchema, DetectionConfig};

/// Upper bound on anchors accepted from one output tensor.
const MAX_MODEL_ANCHORS: usize = 50_000;

/// Fraction of the shorter frame side covered by a synthesized whole-frame box.
const WHOLE_FRAME_BOX_RATIO: f32 = 0.6;

/// Interpretation of a raw output tensor, chosen once per inference from its dims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputLayout {
    /// `[batch, 1]`: one accident score.
    SingleScore,
    /// `[batch, 2]`: `[no_accident, accident]`.
    TwoClass,
    /// `[batch, anchors, features]`
    AnchorsFeaturesLast { anchors: usize, features: usize },
    /// `[batch, features, anchors]`
    AnchorsFeaturesFirst { anchors: usize, features: usize },
    /// `[batch, anchors * stride]`
    Flattened { stride: usize },
    /// Nothing recognisable; `output[0]` is read as the accident score.
    Fallback,
}

impl OutputLayout {
    pub fn classify(dims: &[usize], flattened_stride: usize) -> Self {
        match *dims {
            [_, 1] => OutputLayout::SingleScore,
            [_, 2] => OutputLayout::TwoClass,
            [_, n] if n > 4 => OutputLayout::Flattened {
                stride: flattened_stride.min(n),
            },
            [_, a, f] => {
                // Anchors normally outnumber features; a short anchor axis
                // only counts as features when the other axis cannot.
                if f >= 5 && (a < 5 || f <= a) {
                    OutputLayout::AnchorsFeaturesLast {
                        anchors: a,
                        features: f,
                    }
                } else if a >= 5 {
                    OutputLayout::AnchorsFeaturesFirst {
                        anchors: f,
                        features: a,
                    }
                } else {
                    OutputLayout::Fallback
                }
            }
            _ => OutputLayout::Fallback,
        }
    }

    pub fn is_whole_frame(self) -> bool {
        matches!(
            self,
            OutputLayout::SingleScore | OutputLayout::TwoClass | OutputLayout::Fallback
        )
    }
}

/// How model-space box coordinates map back to the source frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CoordinateMode {
    Letterbox(LetterboxTransform),
    /// Frame was stretched to the model input without padding.
    Stretch,
}

#[derive(Debug, Clone, Copy)]
pub struct DecodeContext {
    pub frame_width: u32,
    pub frame_height: u32,
    pub model_width: u32,
    pub model_height: u32,
    pub mode: CoordinateMode,
}

impl DecodeContext {
    pub fn letterboxed(frame: (u32, u32), model: (u32, u32), transform: LetterboxTransform) -> Self {
        Self {
            frame_width: frame.0,
            frame_height: frame.1,
            model_width: model.0,
            model_height: model.1,
            mode: CoordinateMode::Letterbox(transform),
        }
    }

    pub fn stretched(frame: (u32, u32), model: (u32, u32)) -> Self {
        Self {
            frame_width: frame.0,
            frame_height: frame.1,
            model_width: model.0,
            model_height: model.1,
            mode: CoordinateMode::Stretch,
        }
    }

    /// Maps a model-space point into source pixels.
    fn to_source(&self, x: f32, y: f32) -> (f32, f32) {
        match self.mode {
            CoordinateMode::Letterbox(t) => t.to_source(x, y),
            CoordinateMode::Stretch => (
                x * self.frame_width as f32 / self.model_width.max(1) as f32,
                y * self.frame_height as f32 / self.model_height.max(1) as f32,
            ),
        }
    }
}

#[derive(Debug, Clone)]
#[must_use]
pub struct Decoded {
    pub layout: OutputLayout,
    /// Candidates in source pixels, unsorted.
    pub detections: Vec<Detection>,
    /// Whole-frame score, or the best accepted anchor confidence.
    pub score: f32,
    pub is_accident: bool,
}

/// Raw values above 1 are read as percentages; the result always lies in `0.0..=1.0`.
pub fn clamp_confidence(raw: f32) -> f32 {
    if raw.is_nan() {
        return 0.0;
    }
    let value = if raw > 1.0 { raw / 100.0 } else { raw };
    value.clamp(0.0, 1.0)
}

/// Turns one raw output tensor into candidate detections in source pixels.
#[instrument(skip_all, fields(dims = ?output.dims))]
pub fn decode(
    output: &OutputTensor,
    ctx: &DecodeContext,
    config: &DetectionConfig,
) -> Result<Decoded, VisionError> {
    let data = output.data.as_slice();
    if data.is_empty() {
        return Err(VisionError::InvalidOutputShape {
            expected: "at least one value".into(),
            got: format!("{:?}", output.dims),
        });
    }

    let layout = OutputLayout::classify(&output.dims, config.flattened_stride);
    debug!(?layout, "output layout selected");

    let decoded = match layout {
        OutputLayout::SingleScore | OutputLayout::Fallback => whole_frame(layout, data[0], ctx, config),
        OutputLayout::TwoClass => {
            let raw = data.get(1).copied().ok_or_else(|| short_tensor(output, 2))?;
            whole_frame(layout, raw, ctx, config)
        }
        OutputLayout::AnchorsFeaturesLast { anchors, features } => {
            check_anchor_count(anchors, output)?;
            let needed = anchors * features;
            let view = ArrayView2::from_shape((anchors, features), data.get(..needed).ok_or_else(|| short_tensor(output, needed))?)
                .map_err(|e| VisionError::InvalidOutputShape {
                    expected: format!("[1, {anchors}, {features}]"),
                    got: e.to_string(),
                })?;
            anchor_list(layout, view, None, ctx, config)
        }
        OutputLayout::AnchorsFeaturesFirst { anchors, features } => {
            check_anchor_count(anchors, output)?;
            let needed = anchors * features;
            let view = ArrayView2::from_shape((features, anchors), data.get(..needed).ok_or_else(|| short_tensor(output, needed))?)
                .map_err(|e| VisionError::InvalidOutputShape {
                    expected: format!("[1, {features}, {anchors}]"),
                    got: e.to_string(),
                })?;
            // Transposed view, no copy
            anchor_list(layout, view.reversed_axes(), None, ctx, config)
        }
        OutputLayout::Flattened { stride } => {
            let full_rows = data.len() / stride;
            let (body, tail) = data.split_at(full_rows * stride);
            // A short final row still decodes if it holds a box and a score
            let tail = (!tail.is_empty()).then(|| ArrayView1::from(tail));
            check_anchor_count(full_rows + usize::from(tail.is_some()), output)?;
            let view = ArrayView2::from_shape((full_rows, stride), body).map_err(|e| {
                VisionError::InvalidOutputShape {
                    expected: format!("rows of {stride}"),
                    got: e.to_string(),
                }
            })?;
            anchor_list(layout, view, tail, ctx, config)
        }
    };

    Ok(decoded)
}

fn short_tensor(output: &OutputTensor, needed: usize) -> VisionError {
    VisionError::InvalidOutputShape {
        expected: format!("{needed} values for dims {:?}", output.dims),
        got: format!("{} values", output.data.len()),
    }
}

fn check_anchor_count(anchors: usize, output: &OutputTensor) -> Result<(), VisionError> {
    if anchors > MAX_MODEL_ANCHORS {
        return Err(VisionError::InvalidOutputShape {
            expected: format!("at most {MAX_MODEL_ANCHORS} anchors"),
            got: format!("{:?}", output.dims),
        });
    }
    Ok(())
}

/// Classification output: one centered box when the score clears the cutoff.
fn whole_frame(layout: OutputLayout, raw: f32, ctx: &DecodeContext, config: &DetectionConfig) -> Decoded {
    let score = clamp_confidence(raw);
    let is_accident = score > config.classification_cutoff;

    let mut detections = Vec::new();
    if is_accident {
        let (w, h) = (ctx.frame_width as f32, ctx.frame_height as f32);
        let side = w.min(h) * WHOLE_FRAME_BOX_RATIO;
        if let Some(det) = Detection::new((w - side) / 2.0, (h - side) / 2.0, side, side, score, config.label.as_str()) {
            detections.push(det);
        }
    }

    Decoded {
        layout,
        detections,
        score,
        is_accident,
    }
}

/// Detection-head output, one row per anchor plus an optional short final
/// row. Rows too short for the schema's box and score columns are ignored.
fn anchor_list(
    layout: OutputLayout,
    rows: ArrayView2<'_, f32>,
    tail: Option<ArrayView1<'_, f32>>,
    ctx: &DecodeContext,
    config: &DetectionConfig,
) -> Decoded {
    let schema = &config.anchor;
    let min_features = schema.min_features();
    let mut detections = Vec::new();
    let mut best = 0.0f32;

    for row in rows.rows().into_iter().chain(tail) {
        if row.len() < min_features {
            continue;
        }
        let Some(confidence) = anchor_confidence(row.view(), schema) else {
            continue;
        };
        if confidence <= config.confidence_threshold {
            continue;
        }
        if let Some(det) = anchor_box(row.view(), schema, confidence, ctx, &config.label) {
            best = best.max(det.confidence);
            detections.push(det);
        }
    }

    Decoded {
        layout,
        is_accident: !detections.is_empty(),
        detections,
        score: best,
    }
}

/// Objectness times target-class score, or `None` if another class in the
/// dominance window scores at least as high as the target.
fn anchor_confidence(row: ArrayView1<'_, f32>, schema: &AnchorSchema) -> Option<f32> {
    let objectness = schema
        .objectness_index
        .and_then(|idx| row.get(idx).copied())
        .map(clamp_confidence);

    let target_idx = schema.class_offset + schema.target_class;
    let class_score = match row.get(target_idx).copied() {
        Some(target) => {
            if !target.is_finite() {
                return None;
            }
            let window_end = (schema.class_offset + schema.dominance_window).min(row.len());
            let outranked = (schema.class_offset..window_end)
                .filter(|&idx| idx != target_idx)
                .any(|idx| row[idx] >= target);
            if outranked {
                return None;
            }
            Some(clamp_confidence(target))
        }
        None => None,
    };

    match (objectness, class_score) {
        (Some(obj), Some(cls)) => Some(obj * cls),
        (Some(obj), None) => Some(obj),
        (None, Some(cls)) => Some(cls),
        (None, None) => None,
    }
}

fn anchor_box(
    row: ArrayView1<'_, f32>,
    schema: &AnchorSchema,
    confidence: f32,
    ctx: &DecodeContext,
    label: &str,
) -> Option<Detection> {
    let base = schema.box_offset;
    let (cx, cy, w, h) = (row[base], row[base + 1], row[base + 2], row[base + 3]);
    if ![cx, cy, w, h].iter().all(|v| v.is_finite()) || w <= 0.0 || h <= 0.0 {
        return None;
    }

    // Normalized heads emit every box value in 0..=1
    let (cx, cy, w, h) = if [cx, cy, w, h].iter().all(|&v| v <= 1.0) {
        let (mw, mh) = (ctx.model_width as f32, ctx.model_height as f32);
        (cx * mw, cy * mh, w * mw, h * mh)
    } else {
        (cx, cy, w, h)
    };

    let (x1, y1) = ctx.to_source(cx - w / 2.0, cy - h / 2.0);
    let (x2, y2) = ctx.to_source(cx + w / 2.0, cy + h / 2.0);

    let (fw, fh) = (ctx.frame_width as f32, ctx.frame_height as f32);
    let x1 = x1.max(0.0);
    let y1 = y1.max(0.0);
    let x2 = x2.min(fw);
    let y2 = y2.min(fh);

    Detection::new(x1, y1, x2 - x1, y2 - y1, confidence, label)
}
