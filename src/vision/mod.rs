mod decode;
mod engine;
mod nms;
#[cfg(feature = "ml")]
mod ort_backend;
mod pipeline;
mod preprocess;
mod stabilizer;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use decode::{clamp_confidence, decode, CoordinateMode, DecodeContext, Decoded, OutputLayout};
pub use engine::{
    load_model, BackendLoader, EngineOptions, ExecutionBackend, InferenceEngine, OutputTensor,
    TensorInfo,
};
pub use nms::{iou, suppress};
#[cfg(feature = "ml")]
pub use ort_backend::{OrtEngine, OrtLoader};
pub use pipeline::{DetectionPipeline, FrameAnalysis};
pub use preprocess::{preprocess, InputTensor, LetterboxTransform};
pub use stabilizer::{StabilizedResult, TemporalStabilizer};

// ============================================================================
// Error Types
// ============================================================================

#[derive(thiserror::Error, Debug)]
pub enum VisionError {
    #[error("model load failed for {path}: {reason}")]
    ModelLoad { path: String, reason: String },

    #[error("invalid frame: {width}x{height}")]
    InvalidFrame { width: u32, height: u32 },

    #[error("invalid pixel buffer: expected {expected} bytes, got {got}")]
    InvalidPixelBuffer { expected: usize, got: usize },

    #[error("inference failed: {0}")]
    Inference(String), // Sanitized - no raw engine errors

    #[error("invalid model output shape")]
    InvalidOutputShape { expected: String, got: String },

    #[error("seek did not complete within {0:?}")]
    SeekTimeout(Duration),

    #[error("image decode failed")]
    Decode(#[source] image::ImageError),

    #[error("input bytes empty")]
    EmptyInput,

    #[error("compressed image too large: {size} bytes (max: {max})")]
    CompressedTooLarge { size: usize, max: usize },

    #[error("decompressed image too large: {width}x{height} pixels (max: {max_pixels})")]
    PixelCountTooLarge {
        width: u32,
        height: u32,
        max_pixels: u64,
    },

    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("media source error: {0}")]
    Source(String),

    #[error("operation not allowed while session is {0}")]
    InvalidState(String),
}

impl VisionError {
    /// Errors confined to one frame. The loop logs these and moves on.
    pub fn is_frame_local(&self) -> bool {
        matches!(
            self,
            VisionError::InvalidFrame { .. }
                | VisionError::InvalidPixelBuffer { .. }
                | VisionError::Inference(_)
                | VisionError::InvalidOutputShape { .. }
                | VisionError::SeekTimeout(_)
                | VisionError::Source(_)
        )
    }

    /// Errors that end a session: nothing can be detected without a model.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VisionError::ModelLoad { .. })
    }
}

// ============================================================================
// Detection
// ============================================================================

/// One detected region in source-frame pixel space (origin top-left).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[must_use]
pub struct Detection {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Always within 0.0..=1.0
    pub confidence: f32,
    pub label: String,
}

impl Detection {
    /// Builds a detection, clamping the confidence. Returns `None` for boxes
    /// with non-finite coordinates or a non-positive side.
    pub fn new(
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        confidence: f32,
        label: impl Into<String>,
    ) -> Option<Self> {
        if ![x, y, width, height].iter().all(|v| v.is_finite()) {
            return None;
        }
        if width <= 0.0 || height <= 0.0 {
            return None;
        }
        Some(Self {
            x,
            y,
            width,
            height,
            confidence: clamp_confidence(confidence),
            label: label.into(),
        })
    }

    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Intersection over union with another box.
    pub fn iou(&self, other: &Detection) -> f32 {
        iou(self, other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_rejects_degenerate_boxes() {
        assert!(Detection::new(0.0, 0.0, 0.0, 10.0, 0.5, "a").is_none());
        assert!(Detection::new(0.0, 0.0, 10.0, -1.0, 0.5, "a").is_none());
        assert!(Detection::new(f32::NAN, 0.0, 10.0, 10.0, 0.5, "a").is_none());
    }

    #[test]
    fn detection_clamps_confidence() {
        let det = Detection::new(0.0, 0.0, 10.0, 10.0, 87.0, "a").unwrap();
        assert!((det.confidence - 0.87).abs() < 1e-6);

        let det = Detection::new(0.0, 0.0, 10.0, 10.0, -3.0, "a").unwrap();
        assert_eq!(det.confidence, 0.0);
    }

    #[test]
    fn detection_geometry_helpers() {
        let det = Detection::new(10.0, 20.0, 30.0, 40.0, 0.9, "a").unwrap();
        assert_eq!(det.right(), 40.0);
        assert_eq!(det.bottom(), 60.0);
        assert_eq!(det.area(), 1200.0);
        assert_eq!(det.center(), (25.0, 40.0));
    }

    #[test]
    fn error_classification() {
        assert!(VisionError::Inference("boom".into()).is_frame_local());
        assert!(VisionError::SeekTimeout(Duration::from_secs(3)).is_frame_local());
        assert!(!VisionError::Inference("boom".into()).is_fatal());

        let load = VisionError::ModelLoad {
            path: "best.onnx".into(),
            reason: "no backend".into(),
        };
        assert!(load.is_fatal());
        assert!(!load.is_frame_local());
    }
}
