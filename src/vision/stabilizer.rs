use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::Detection;

/// Outcome of one stabilizer step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StabilizedResult {
    NoDetection,
    /// Something was seen, but not in enough recent frames yet.
    Analyzing { active_frames: usize },
    /// Enough recent frames agree; carries the latest frame's detections.
    Confirmed {
        detections: Vec<Detection>,
        active_frames: usize,
    },
}

impl StabilizedResult {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, StabilizedResult::Confirmed { .. })
    }

    /// Detections safe to show as an alert; empty unless confirmed.
    pub fn detections(&self) -> &[Detection] {
        match self {
            StabilizedResult::Confirmed { detections, .. } => detections,
            _ => &[],
        }
    }
}

/// Sliding-window agreement filter over per-frame NMS output.
///
/// No identity association between frames: a frame "agrees" when it has
/// at least one detection.
#[derive(Debug, Clone)]
pub struct TemporalStabilizer {
    history: VecDeque<Vec<Detection>>,
    capacity: usize,
    min_agreeing: usize,
}

impl TemporalStabilizer {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize, min_agreeing: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            history: VecDeque::with_capacity(capacity),
            capacity,
            min_agreeing,
        }
    }

    /// Records one frame and returns the stabilized decision.
    ///
    /// `Confirmed` needs both `min_agreeing` non-empty frames in the window
    /// and a non-empty latest frame, since the confirmed boxes are the latest
    /// frame's. Enough agreement with an empty latest frame (`[hit, hit, hit,
    /// empty]`) reports `Analyzing`. This reading is assumed; it is also what
    /// makes two hits followed by three misses settle on `NoDetection`.
    pub fn observe(&mut self, frame_detections: Vec<Detection>) -> StabilizedResult {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(frame_detections);

        let active_frames = self.active_frames();
        let latest = self.history.back().map(Vec::as_slice).unwrap_or_default();

        if active_frames >= self.min_agreeing && !latest.is_empty() {
            StabilizedResult::Confirmed {
                detections: latest.to_vec(),
                active_frames,
            }
        } else if !latest.is_empty() || active_frames >= self.min_agreeing {
            // Agreement without a current box still has nothing to draw
            StabilizedResult::Analyzing { active_frames }
        } else {
            StabilizedResult::NoDetection
        }
    }

    pub fn active_frames(&self) -> usize {
        self.history.iter().filter(|dets| !dets.is_empty()).count()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Forget all history; called when a new source is loaded.
    pub fn reset(&mut self) {
        self.history.clear();
    }
}
