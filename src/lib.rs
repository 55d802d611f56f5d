//! Client-side accident detection core.
//!
//! Takes decoded frames (still images or video), runs them through an
//! opaque detection model, and turns the raw output into stable,
//! pixel-space detections that a dashboard can render and alert on.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]

pub mod config;
pub mod frame;
pub mod session;
pub mod source;
pub mod vision;

pub use config::{AnchorSchema, DetectionConfig};
pub use frame::{decode_image, Frame, ImageLimits, PixelFormat};
pub use session::{
    DetectionSession, DetectionUpdate, FramePosition, LiveEnd, LiveSummary, OverallStatus,
    ScanSample, ScanSummary, SessionState, StopHandle,
};
pub use source::{FrameSequence, PlaybackState, VideoSource};
pub use vision::{
    Detection, DetectionPipeline, FrameAnalysis, LetterboxTransform, OutputLayout,
    StabilizedResult, TemporalStabilizer, VisionError,
};

/// Model input edge used when the model does not declare a static shape.
pub const DEFAULT_INPUT_SIZE: u32 = 640;

/// Frame rate assumed for frame-index arithmetic when the source does not report one.
pub const ASSUMED_FPS: f64 = 30.0;

/// Label attached to every detection produced by the accident model.
pub const ACCIDENT_LABEL: &str = "Accident Detected";
