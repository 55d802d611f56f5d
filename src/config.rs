use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::vision::VisionError;
use crate::{ACCIDENT_LABEL, ASSUMED_FPS};

/// Feature ordering inside one anchor row of a detection head.
///
/// The default matches the common `[cx, cy, w, h, obj, class0, class1, ...]`
/// export. Models exported with a different ordering (no objectness column,
/// a different target class) can be described here instead of patching the
/// decoder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorSchema {
    /// Index of `cx`; `cy`, `w`, `h` follow.
    pub box_offset: usize,
    pub objectness_index: Option<usize>,
    /// Index of the first class score.
    pub class_offset: usize,
    /// Class (relative to `class_offset`) that means "accident".
    pub target_class: usize,
    /// How many class scores take part in the dominance check.
    pub dominance_window: usize,
}

impl Default for AnchorSchema {
    fn default() -> Self {
        Self {
            box_offset: 0,
            objectness_index: Some(4),
            class_offset: 5,
            target_class: 0,
            dominance_window: 4,
        }
    }
}

impl AnchorSchema {
    /// Smallest anchor row that carries a box plus a usable score.
    pub fn min_features(&self) -> usize {
        let box_end = self.box_offset + 4;
        let score_end = match self.objectness_index {
            Some(idx) => idx + 1,
            None => self.class_offset + self.target_class + 1,
        };
        box_end.max(score_end)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Anchors at or below this confidence are discarded.
    pub confidence_threshold: f32,
    /// Whole-frame scores above this produce a synthesized box.
    pub classification_cutoff: f32,
    pub iou_threshold: f32,
    pub history_window: usize,
    pub min_agreeing_frames: usize,
    pub frame_sample_interval_secs: f64,
    pub seek_timeout_ms: u64,
    pub refresh_interval_ms: u64,
    pub assumed_fps: f64,
    pub max_nms_inputs: usize,
    pub max_detections: usize,
    /// Minimum width and height in source pixels for a reported box.
    pub min_box_side: f32,
    pub flattened_stride: usize,
    pub label: String,
    pub anchor: AnchorSchema,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.3,
            classification_cutoff: 0.5,
            iou_threshold: 0.45,
            history_window: 5,
            min_agreeing_frames: 3,
            frame_sample_interval_secs: 0.5,
            seek_timeout_ms: 3000,
            refresh_interval_ms: 16,
            assumed_fps: ASSUMED_FPS,
            max_nms_inputs: 300,
            max_detections: 5,
            min_box_side: 10.0,
            flattened_stride: 6,
            label: ACCIDENT_LABEL.to_string(),
            anchor: AnchorSchema::default(),
        }
    }
}

impl DetectionConfig {
    pub fn from_json_str(json: &str) -> Result<Self, VisionError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| VisionError::Config(format!("malformed config: {e}")))?;
        config.validated()
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, VisionError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| VisionError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn with_confidence_threshold(mut self, threshold: f32) -> Self {
        self.confidence_threshold = threshold;
        self
    }

    pub fn with_iou_threshold(mut self, threshold: f32) -> Self {
        self.iou_threshold = threshold;
        self
    }

    pub fn with_history(mut self, window: usize, min_agreeing: usize) -> Self {
        self.history_window = window;
        self.min_agreeing_frames = min_agreeing;
        self
    }

    pub fn with_frame_sample_interval(mut self, secs: f64) -> Self {
        self.frame_sample_interval_secs = secs;
        self
    }

    pub fn with_seek_timeout(mut self, timeout: Duration) -> Self {
        self.seek_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_anchor_schema(mut self, anchor: AnchorSchema) -> Self {
        self.anchor = anchor;
        self
    }

    pub fn seek_timeout(&self) -> Duration {
        Duration::from_millis(self.seek_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.max(1))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), VisionError> {
        let unit = |name: &str, v: f32| {
            if v.is_finite() && v > 0.0 && v < 1.0 {
                Ok(())
            } else {
                Err(VisionError::Config(format!("{name} must be in (0, 1), got {v}")))
            }
        };
        unit("confidence_threshold", self.confidence_threshold)?;
        unit("classification_cutoff", self.classification_cutoff)?;
        unit("iou_threshold", self.iou_threshold)?;

        if self.history_window == 0 {
            return Err(VisionError::Config("history_window must be at least 1".into()));
        }
        if self.min_agreeing_frames == 0 || self.min_agreeing_frames > self.history_window {
            return Err(VisionError::Config(format!(
                "min_agreeing_frames must be in 1..={}, got {}",
                self.history_window, self.min_agreeing_frames
            )));
        }
        if !(self.frame_sample_interval_secs.is_finite() && self.frame_sample_interval_secs > 0.0)
        {
            return Err(VisionError::Config(
                "frame_sample_interval_secs must be positive".into(),
            ));
        }
        if !(self.assumed_fps.is_finite() && self.assumed_fps > 0.0) {
            return Err(VisionError::Config("assumed_fps must be positive".into()));
        }
        if self.max_nms_inputs == 0 || self.max_detections == 0 {
            return Err(VisionError::Config(
                "max_nms_inputs and max_detections must be at least 1".into(),
            ));
        }
        if !(self.min_box_side.is_finite() && self.min_box_side >= 0.0) {
            return Err(VisionError::Config("min_box_side must be non-negative".into()));
        }
        if self.flattened_stride < 5 {
            return Err(VisionError::Config(format!(
                "flattened_stride must be at least 5, got {}",
                self.flattened_stride
            )));
        }
        if self.anchor.dominance_window == 0 {
            return Err(VisionError::Config("anchor.dominance_window must be at least 1".into()));
        }
        if self.anchor.target_class >= self.anchor.dominance_window {
            return Err(VisionError::Config(
                "anchor.target_class must fall inside the dominance window".into(),
            ));
        }
        Ok(())
    }

    pub fn validated(self) -> Result<Self, VisionError> {
        self.validate()?;
        Ok(self)
    }
}
