use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::frame::Frame;
use crate::vision::VisionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// Metadata not available yet; frames have no size.
    Loading,
    Playing,
    Paused,
    Ended,
}

/// A video the host is playing: a media element, a decoder, or a frame dump.
///
/// `seek` resolves when the new position is displayable. It may never
/// resolve; callers bound it with a timeout.
#[async_trait]
pub trait VideoSource: Send {
    fn natural_size(&self) -> (u32, u32);

    fn state(&self) -> PlaybackState;

    /// Media duration in seconds, once known.
    fn duration(&self) -> Option<f64>;

    fn fps(&self) -> Option<f64>;

    fn current_time(&self) -> f64;

    async fn seek(&mut self, seconds: f64) -> Result<(), VisionError>;

    /// Grab the currently displayed frame.
    async fn capture(&mut self) -> Result<Frame, VisionError>;
}

/// In-memory video: a list of decoded frames at a fixed rate.
///
/// While playing, every capture advances one frame; the sequence ends after
/// the last one.
#[derive(Debug, Clone)]
pub struct FrameSequence {
    frames: Vec<Frame>,
    fps: f64,
    position: usize,
    state: PlaybackState,
    seek_delay: Option<Duration>,
}

impl FrameSequence {
    pub fn new(frames: Vec<Frame>, fps: f64) -> Result<Self, VisionError> {
        if !(fps.is_finite() && fps > 0.0) {
            return Err(VisionError::Source(format!("invalid frame rate {fps}")));
        }
        let state = if frames.is_empty() {
            PlaybackState::Ended
        } else {
            PlaybackState::Playing
        };
        Ok(Self {
            frames,
            fps,
            position: 0,
            state,
            seek_delay: None,
        })
    }

    /// Simulates a slow decoder: every seek takes `delay` to settle.
    pub fn with_seek_delay(mut self, delay: Duration) -> Self {
        self.seek_delay = Some(delay);
        self
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn pause(&mut self) {
        if self.state == PlaybackState::Playing {
            self.state = PlaybackState::Paused;
        }
    }

    pub fn play(&mut self) {
        if self.state == PlaybackState::Paused {
            self.state = PlaybackState::Playing;
        }
    }
}

#[async_trait]
impl VideoSource for FrameSequence {
    fn natural_size(&self) -> (u32, u32) {
        self.frames.first().map_or((0, 0), Frame::natural_size)
    }

    fn state(&self) -> PlaybackState {
        self.state
    }

    fn duration(&self) -> Option<f64> {
        Some(self.frames.len() as f64 / self.fps)
    }

    fn fps(&self) -> Option<f64> {
        Some(self.fps)
    }

    fn current_time(&self) -> f64 {
        self.position as f64 / self.fps
    }

    async fn seek(&mut self, seconds: f64) -> Result<(), VisionError> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(VisionError::Source(format!("invalid seek target {seconds}")));
        }
        if let Some(delay) = self.seek_delay {
            tokio::time::sleep(delay).await;
        }
        let last = self.frames.len().saturating_sub(1);
        self.position = ((seconds * self.fps).round() as usize).min(last);
        debug!(seconds, position = self.position, "seek complete");
        Ok(())
    }

    async fn capture(&mut self) -> Result<Frame, VisionError> {
        let frame = self
            .frames
            .get(self.position)
            .cloned()
            .ok_or_else(|| VisionError::Source("no frame at current position".into()))?;

        if self.state == PlaybackState::Playing {
            self.position += 1;
            if self.position >= self.frames.len() {
                self.position = self.frames.len().saturating_sub(1);
                self.state = PlaybackState::Ended;
            }
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequence(n: usize) -> FrameSequence {
        let frames = (0..n)
            .map(|i| Frame::filled(8, 6, [i as u8, 0, 0]).unwrap())
            .collect();
        FrameSequence::new(frames, 2.0).unwrap()
    }

    #[tokio::test]
    async fn playing_sequence_advances_and_ends() {
        let mut seq = sequence(3);
        assert_eq!(seq.natural_size(), (8, 6));
        assert_eq!(seq.duration(), Some(1.5));

        for expected in 0..3u8 {
            let frame = seq.capture().await.unwrap();
            assert_eq!(frame.data()[0], expected);
        }
        assert_eq!(seq.state(), PlaybackState::Ended);
    }

    #[tokio::test]
    async fn seek_picks_nearest_frame() {
        let mut seq = sequence(4);
        seq.pause();
        seq.seek(1.0).await.unwrap();
        assert_eq!(seq.position(), 2);
        assert_eq!(seq.capture().await.unwrap().data()[0], 2);
        // Paused sources do not advance on capture
        assert_eq!(seq.position(), 2);

        seq.seek(100.0).await.unwrap();
        assert_eq!(seq.position(), 3);
        assert!(seq.seek(-1.0).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn seek_delay_is_observed() {
        let mut seq = sequence(2).with_seek_delay(Duration::from_secs(5));
        let start = tokio::time::Instant::now();
        seq.seek(0.5).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[test]
    fn empty_sequence_is_ended() {
        let seq = FrameSequence::new(vec![], 30.0).unwrap();
        assert_eq!(seq.state(), PlaybackState::Ended);
        assert_eq!(seq.natural_size(), (0, 0));
        assert!(FrameSequence::new(vec![], 0.0).is_err());
    }
}
