//! Detection session: model lifecycle plus the image, live and scan drivers.

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::DetectionConfig;
use crate::frame::Frame;
use crate::source::{PlaybackState, VideoSource};
use crate::vision::{
    load_model, BackendLoader, Detection, DetectionPipeline, EngineOptions, FrameAnalysis,
    StabilizedResult, TemporalStabilizer, VisionError,
};

// ============================================================================
// Published types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Loading,
    Ready,
    Detecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FramePosition {
    /// A still image.
    Still,
    /// Media time in seconds.
    Timestamp(f64),
    FrameIndex(u64),
}

/// Human-facing summary of the latest outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum OverallStatus {
    AccidentDetected { confidence: f32 },
    NoAccident,
    Analyzing,
    VideoLoading,
    ModelLoadFailed(String),
    Warning(String),
}

impl OverallStatus {
    pub fn from_error(err: &VisionError) -> Self {
        match err {
            VisionError::ModelLoad { reason, .. } => OverallStatus::ModelLoadFailed(reason.clone()),
            other => OverallStatus::Warning(other.to_string()),
        }
    }

    fn from_analysis(analysis: &FrameAnalysis) -> Self {
        if analysis.is_accident {
            OverallStatus::AccidentDetected {
                confidence: analysis.score,
            }
        } else {
            OverallStatus::NoAccident
        }
    }

    fn from_stabilized(result: &StabilizedResult) -> Self {
        match result {
            StabilizedResult::Confirmed { detections, .. } => OverallStatus::AccidentDetected {
                confidence: detections.iter().map(|d| d.confidence).fold(0.0, f32::max),
            },
            StabilizedResult::Analyzing { .. } => OverallStatus::Analyzing,
            StabilizedResult::NoDetection => OverallStatus::NoAccident,
        }
    }

    pub fn is_accident(&self) -> bool {
        matches!(self, OverallStatus::AccidentDetected { .. })
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverallStatus::AccidentDetected { confidence } if *confidence > 0.0 => {
                write!(f, "Accident Detected ({:.1}%)", confidence * 100.0)
            }
            OverallStatus::AccidentDetected { .. } => f.write_str("Accident Detected"),
            OverallStatus::NoAccident => f.write_str("No Accident Detected"),
            OverallStatus::Analyzing => f.write_str("Analyzing..."),
            OverallStatus::VideoLoading => f.write_str("Video is loading..."),
            OverallStatus::ModelLoadFailed(reason) => write!(f, "Model Loading Failed: {reason}"),
            OverallStatus::Warning(message) => write!(f, "⚠ {message}"),
        }
    }
}

/// One published decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionUpdate {
    pub session_id: Uuid,
    pub position: FramePosition,
    pub detections: Vec<Detection>,
    pub status: OverallStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSample {
    pub timestamp: f64,
    pub frame_index: u64,
    pub score: f32,
    pub is_accident: bool,
    pub detections: Vec<Detection>,
}

/// Result of a one-shot pass over a whole video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub session_id: Uuid,
    pub frames_scanned: usize,
    pub frames_skipped: usize,
    pub frames_with_detections: usize,
    pub total_detections: usize,
    pub max_confidence: f32,
    pub is_accident: bool,
    pub seek_timeouts: usize,
    /// True if the scan was stopped before the end of the media.
    pub cancelled: bool,
    pub samples: Vec<ScanSample>,
}

impl ScanSummary {
    fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            frames_scanned: 0,
            frames_skipped: 0,
            frames_with_detections: 0,
            total_detections: 0,
            max_confidence: 0.0,
            is_accident: false,
            seek_timeouts: 0,
            cancelled: false,
            samples: Vec::new(),
        }
    }

    pub fn status(&self) -> OverallStatus {
        if self.is_accident {
            OverallStatus::AccidentDetected {
                confidence: self.max_confidence,
            }
        } else {
            OverallStatus::NoAccident
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveEnd {
    Stopped,
    Paused,
    Ended,
    /// Update receiver went away.
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveSummary {
    pub frames_processed: usize,
    pub frames_skipped: usize,
    /// Refreshes that arrived while an inference was still running.
    pub frames_dropped: usize,
    pub updates_published: usize,
    pub end: LiveEnd,
}

// ============================================================================
// Cancellation
// ============================================================================

/// Cloneable stop signal for a running detection loop.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Resolves once `stop` has been called.
    pub async fn stopped(&self) {
        if self.is_stopped() {
            return;
        }
        self.notify.notified().await;
    }
}

type InFlight = Pin<Box<dyn Future<Output = (FramePosition, Result<FrameAnalysis, VisionError>)> + Send>>;

// ============================================================================
// Session
// ============================================================================

/// Binds one model, one configuration and one source at a time.
///
/// `Idle -> Loading -> Ready -> Detecting -> Ready`. The model handle is
/// kept for the session's lifetime; a failed load returns to `Idle`.
#[derive(Debug)]
pub struct DetectionSession {
    id: Uuid,
    config: DetectionConfig,
    state: SessionState,
    pipeline: Option<DetectionPipeline>,
    stabilizer: TemporalStabilizer,
}

impl DetectionSession {
    pub fn new(config: DetectionConfig) -> Result<Self, VisionError> {
        config.validate()?;
        let stabilizer = TemporalStabilizer::new(config.history_window, config.min_agreeing_frames);
        Ok(Self {
            id: Uuid::new_v4(),
            config,
            state: SessionState::Idle,
            pipeline: None,
            stabilizer,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            info!(session_id = %self.id, from = ?self.state, to = ?next, "session state change");
            self.state = next;
        }
    }

    /// Loads the model, trying each configured backend in turn.
    ///
    /// # Errors
    ///
    /// `ModelLoad` when no backend initializes; the session is left `Idle`.
    #[instrument(skip(self, loader, options), fields(session_id = %self.id))]
    pub async fn load(
        &mut self,
        loader: &dyn BackendLoader,
        path: &Path,
        options: &EngineOptions,
    ) -> Result<(), VisionError> {
        if self.state == SessionState::Detecting || self.state == SessionState::Loading {
            return Err(VisionError::InvalidState(format!("{:?}", self.state)));
        }

        self.pipeline = None;
        self.transition(SessionState::Loading);

        let loaded = match load_model(loader, path, options).await {
            Ok(engine) => DetectionPipeline::new(engine, self.config.clone()),
            Err(e) => Err(e),
        };

        match loaded {
            Ok(pipeline) => {
                self.pipeline = Some(pipeline);
                self.transition(SessionState::Ready);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "model load failed");
                self.transition(SessionState::Idle);
                Err(e)
            }
        }
    }

    fn ready_pipeline(&self) -> Result<DetectionPipeline, VisionError> {
        match (&self.state, &self.pipeline) {
            (SessionState::Ready, Some(pipeline)) => Ok(pipeline.clone()),
            (state, _) => Err(VisionError::InvalidState(format!("{state:?}"))),
        }
    }

    /// Runs one still image through the pipeline (no temporal filtering).
    pub async fn detect_image(&mut self, frame: &Frame) -> Result<DetectionUpdate, VisionError> {
        let pipeline = self.ready_pipeline()?;
        self.transition(SessionState::Detecting);
        let result = pipeline.analyze(frame).await;
        self.transition(SessionState::Ready);

        let analysis = result?;
        Ok(DetectionUpdate {
            session_id: self.id,
            position: FramePosition::Still,
            status: OverallStatus::from_analysis(&analysis),
            detections: analysis.detections,
        })
    }

    /// Live detection on a playing video, one inference in flight at most.
    ///
    /// Every refresh tick either starts an inference on the current frame or,
    /// if one is still running, is dropped. Results go through the temporal
    /// stabilizer and are published on `updates` unless `stop` fired first.
    #[instrument(skip_all, fields(session_id = %self.id))]
    pub async fn run_live<S>(
        &mut self,
        source: &mut S,
        updates: &mpsc::Sender<DetectionUpdate>,
        stop: &StopHandle,
    ) -> Result<LiveSummary, VisionError>
    where
        S: VideoSource + ?Sized,
    {
        let pipeline = self.ready_pipeline()?;
        self.stabilizer.reset();
        self.transition(SessionState::Detecting);

        let result = self.live_loop(&pipeline, source, updates, stop).await;

        self.transition(SessionState::Ready);
        if let Ok(summary) = &result {
            info!(
                end = ?summary.end,
                processed = summary.frames_processed,
                dropped = summary.frames_dropped,
                "live detection finished"
            );
        }
        result
    }

    async fn live_loop<S>(
        &mut self,
        pipeline: &DetectionPipeline,
        source: &mut S,
        updates: &mpsc::Sender<DetectionUpdate>,
        stop: &StopHandle,
    ) -> Result<LiveSummary, VisionError>
    where
        S: VideoSource + ?Sized,
    {
        let mut summary = LiveSummary {
            frames_processed: 0,
            frames_skipped: 0,
            frames_dropped: 0,
            updates_published: 0,
            end: LiveEnd::Stopped,
        };

        let mut ticker = interval(self.config.refresh_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut in_flight: Option<InFlight> = None;
        let mut draining = false;
        let mut announced_loading = false;

        loop {
            if stop.is_stopped() {
                summary.end = LiveEnd::Stopped;
                break;
            }

            tokio::select! {
                biased;

                () = stop.stopped() => {
                    summary.end = LiveEnd::Stopped;
                    break;
                }

                (position, result) = async {
                    match in_flight.as_mut() {
                        Some(fut) => fut.await,
                        None => std::future::pending().await,
                    }
                }, if in_flight.is_some() => {
                    in_flight = None;

                    // A pause that landed during inference invalidates the frame
                    if source.state() == PlaybackState::Paused {
                        debug!("paused while inference ran, discarding result");
                        summary.end = LiveEnd::Paused;
                        break;
                    }

                    let update = match result {
                        Ok(analysis) => {
                            summary.frames_processed += 1;
                            let stabilized = self.stabilizer.observe(analysis.detections);
                            DetectionUpdate {
                                session_id: self.id,
                                position,
                                status: OverallStatus::from_stabilized(&stabilized),
                                detections: stabilized.detections().to_vec(),
                            }
                        }
                        Err(e) if e.is_frame_local() => {
                            warn!(error = %e, "frame skipped");
                            counter!("detection.frames.skipped").increment(1);
                            summary.frames_skipped += 1;
                            DetectionUpdate {
                                session_id: self.id,
                                position,
                                status: OverallStatus::from_error(&e),
                                detections: Vec::new(),
                            }
                        }
                        Err(e) => return Err(e),
                    };

                    if !Self::publish(updates, stop, update).await {
                        summary.end = if stop.is_stopped() { LiveEnd::Stopped } else { LiveEnd::Disconnected };
                        break;
                    }
                    summary.updates_published += 1;

                    if draining {
                        summary.end = LiveEnd::Ended;
                        break;
                    }
                }

                _ = ticker.tick() => {
                    match source.state() {
                        PlaybackState::Paused => {
                            if in_flight.is_some() {
                                debug!("paused with inference in flight, discarding result");
                            }
                            summary.end = LiveEnd::Paused;
                            break;
                        }
                        PlaybackState::Ended => {
                            if in_flight.is_none() {
                                summary.end = LiveEnd::Ended;
                                break;
                            }
                            draining = true;
                        }
                        PlaybackState::Loading => {
                            if !announced_loading {
                                announced_loading = true;
                                let update = DetectionUpdate {
                                    session_id: self.id,
                                    position: FramePosition::Timestamp(source.current_time()),
                                    detections: Vec::new(),
                                    status: OverallStatus::VideoLoading,
                                };
                                if !Self::publish(updates, stop, update).await {
                                    summary.end = if stop.is_stopped() { LiveEnd::Stopped } else { LiveEnd::Disconnected };
                                    break;
                                }
                                summary.updates_published += 1;
                            }
                        }
                        PlaybackState::Playing if in_flight.is_some() => {
                            counter!("detection.frames.dropped").increment(1);
                            summary.frames_dropped += 1;
                        }
                        PlaybackState::Playing => {
                            let position = FramePosition::Timestamp(source.current_time());
                            match source.capture().await {
                                Ok(frame) => {
                                    let pipeline = pipeline.clone();
                                    in_flight = Some(Box::pin(async move {
                                        let result = pipeline.analyze(&frame).await;
                                        (position, result)
                                    }));
                                }
                                Err(e) => {
                                    warn!(error = %e, "frame capture failed");
                                    counter!("detection.frames.skipped").increment(1);
                                    summary.frames_skipped += 1;
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Sends an update unless the loop was stopped. Returns false when the
    /// loop should end.
    async fn publish(
        updates: &mpsc::Sender<DetectionUpdate>,
        stop: &StopHandle,
        update: DetectionUpdate,
    ) -> bool {
        if stop.is_stopped() {
            debug!("stopped before publish, discarding result");
            return false;
        }
        updates.send(update).await.is_ok()
    }

    /// One-shot scan: seek through the video at a fixed stride and analyze
    /// each sampled frame. NMS runs per frame; no temporal filtering.
    ///
    /// Seeks that do not settle within the configured timeout are logged and
    /// the currently displayed frame is used instead.
    #[instrument(skip_all, fields(session_id = %self.id))]
    pub async fn scan_video<S>(
        &mut self,
        source: &mut S,
        updates: Option<&mpsc::Sender<DetectionUpdate>>,
        stop: &StopHandle,
    ) -> Result<ScanSummary, VisionError>
    where
        S: VideoSource + ?Sized,
    {
        let pipeline = self.ready_pipeline()?;

        let (width, height) = source.natural_size();
        if source.state() == PlaybackState::Loading || width == 0 || height == 0 {
            return Err(VisionError::InvalidFrame { width, height });
        }
        let duration = source
            .duration()
            .filter(|d| d.is_finite() && *d > 0.0)
            .ok_or_else(|| VisionError::Source("video duration unknown".into()))?;
        let fps = source
            .fps()
            .filter(|f| f.is_finite() && *f > 0.0)
            .unwrap_or(self.config.assumed_fps);

        self.transition(SessionState::Detecting);
        let result = self.scan_loop(&pipeline, source, updates, stop, duration, fps).await;
        self.transition(SessionState::Ready);

        if let Ok(summary) = &result {
            info!(
                scanned = summary.frames_scanned,
                skipped = summary.frames_skipped,
                detections = summary.total_detections,
                max_confidence = summary.max_confidence,
                is_accident = summary.is_accident,
                "video scan finished"
            );
        }
        result
    }

    async fn scan_loop<S>(
        &self,
        pipeline: &DetectionPipeline,
        source: &mut S,
        updates: Option<&mpsc::Sender<DetectionUpdate>>,
        stop: &StopHandle,
        duration: f64,
        fps: f64,
    ) -> Result<ScanSummary, VisionError>
    where
        S: VideoSource + ?Sized,
    {
        let mut summary = ScanSummary::new(self.id);
        let step = self.config.frame_sample_interval_secs;
        let seek_timeout = self.config.seek_timeout();

        for index in 0u64.. {
            let t = index as f64 * step;
            if t >= duration {
                break;
            }
            if stop.is_stopped() {
                summary.cancelled = true;
                break;
            }

            match timeout(seek_timeout, source.seek(t)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(timestamp = t, error = %e, "seek failed, using current frame");
                }
                Err(_) => {
                    warn!(timestamp = t, timeout = ?seek_timeout, "seek timed out, using current frame");
                    counter!("detection.scan.seek_timeouts").increment(1);
                    summary.seek_timeouts += 1;
                }
            }

            let analysis = match source.capture().await {
                Ok(frame) => pipeline.analyze(&frame).await,
                Err(e) => Err(e),
            };

            let analysis = match analysis {
                Ok(analysis) => analysis,
                Err(e) if e.is_frame_local() => {
                    warn!(timestamp = t, error = %e, "frame skipped");
                    counter!("detection.frames.skipped").increment(1);
                    summary.frames_skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            summary.frames_scanned += 1;
            if !analysis.detections.is_empty() {
                summary.frames_with_detections += 1;
            }
            summary.total_detections += analysis.detections.len();
            summary.is_accident |= analysis.is_accident;
            if analysis.is_accident {
                summary.max_confidence = summary.max_confidence.max(analysis.score);
            }

            if let Some(updates) = updates {
                let update = DetectionUpdate {
                    session_id: self.id,
                    position: FramePosition::Timestamp(t),
                    detections: analysis.detections.clone(),
                    status: OverallStatus::from_analysis(&analysis),
                };
                if !Self::publish(updates, stop, update).await {
                    summary.cancelled = stop.is_stopped();
                    if summary.cancelled {
                        break;
                    }
                }
            }

            summary.samples.push(ScanSample {
                timestamp: t,
                frame_index: (t * fps).round() as u64,
                score: analysis.score,
                is_accident: analysis.is_accident,
                detections: analysis.detections,
            });
        }

        Ok(summary)
    }
}
