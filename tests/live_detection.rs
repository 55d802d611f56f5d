mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use accident_vision::vision::{EngineOptions, ExecutionBackend};
use accident_vision::{
    DetectionConfig, DetectionSession, Frame, FrameSequence, LiveEnd, OverallStatus,
    PlaybackState, SessionState, StopHandle, VideoSource, VisionError,
};
use async_trait::async_trait;
use tokio::time::Instant;
use common::{accident_output, empty_output, frames, ready_session, FakeLoader, ScriptedEngine};
use tokio::sync::mpsc;

#[tokio::test(start_paused = true)]
async fn slow_inference_drops_refreshes_instead_of_queueing() {
    let engine = Arc::new(ScriptedEngine::always(accident_output(0.9)).with_delay(Duration::from_millis(100)));
    let mut session = ready_session(engine.clone(), DetectionConfig::default()).await;
    let mut source = FrameSequence::new(frames(12), 30.0).unwrap();
    let (tx, mut rx) = mpsc::channel(64);

    let summary = session.run_live(&mut source, &tx, &StopHandle::new()).await.unwrap();

    // 1. Never more than one inference at a time
    assert_eq!(engine.max_concurrent(), 1);
    assert_eq!(engine.calls(), 12);

    // 2. Refreshes during inference were dropped, and the last frame still published
    assert!(summary.frames_dropped > 0, "{summary:?}");
    assert_eq!(summary.frames_processed, 12);
    assert_eq!(summary.updates_published, 12);
    assert_eq!(summary.end, LiveEnd::Ended);
    assert_eq!(session.state(), SessionState::Ready);

    // 3. Stabilizer needs three agreeing frames before confirming
    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    let third = rx.recv().await.unwrap();
    assert_eq!(first.status, OverallStatus::Analyzing);
    assert!(first.detections.is_empty());
    assert_eq!(second.status, OverallStatus::Analyzing);
    assert!(third.status.is_accident());
    assert_eq!(third.detections.len(), 1);
    assert_eq!(third.session_id, session.id());
}

#[tokio::test(start_paused = true)]
async fn stop_while_inference_pending_discards_result() {
    let engine = Arc::new(ScriptedEngine::always(accident_output(0.9)).with_delay(Duration::from_secs(1)));
    let mut session = ready_session(engine.clone(), DetectionConfig::default()).await;
    let mut source = FrameSequence::new(frames(30), 30.0).unwrap();
    let (tx, mut rx) = mpsc::channel(8);
    let stop = StopHandle::new();

    let stopper = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        stopper.stop();
    });

    let summary = session.run_live(&mut source, &tx, &stop).await.unwrap();

    assert_eq!(summary.end, LiveEnd::Stopped);
    assert_eq!(engine.calls(), 1);
    assert_eq!(summary.updates_published, 0);
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn stop_during_final_inference_is_checked_before_publish() {
    let stop = StopHandle::new();
    let engine = Arc::new(
        ScriptedEngine::always(accident_output(0.9))
            .with_delay(Duration::from_millis(40))
            .stopping_on_call(2, stop.clone()),
    );
    let mut session = ready_session(engine.clone(), DetectionConfig::default()).await;
    let mut source = FrameSequence::new(frames(30), 30.0).unwrap();
    let (tx, mut rx) = mpsc::channel(8);

    let summary = session.run_live(&mut source, &tx, &stop).await.unwrap();

    // Calls 0 and 1 publish; call 2 completes after stop and is discarded
    assert_eq!(summary.end, LiveEnd::Stopped);
    assert_eq!(engine.calls(), 3);
    assert_eq!(summary.updates_published, 2);
    assert!(rx.recv().await.is_some());
    assert!(rx.recv().await.is_some());
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn paused_source_ends_loop_without_inference() {
    let engine = Arc::new(ScriptedEngine::always(accident_output(0.9)));
    let mut session = ready_session(engine.clone(), DetectionConfig::default()).await;
    let mut source = FrameSequence::new(frames(5), 30.0).unwrap();
    source.pause();
    let (tx, _rx) = mpsc::channel(8);

    let summary = session.run_live(&mut source, &tx, &StopHandle::new()).await.unwrap();

    assert_eq!(summary.end, LiveEnd::Paused);
    assert_eq!(engine.calls(), 0);
}

/// Plays a frame sequence, then reports `Paused` from a fixed instant on.
struct PausesAt {
    inner: FrameSequence,
    pause_at: Instant,
}

#[async_trait]
impl VideoSource for PausesAt {
    fn natural_size(&self) -> (u32, u32) {
        self.inner.natural_size()
    }

    fn state(&self) -> PlaybackState {
        if Instant::now() >= self.pause_at {
            PlaybackState::Paused
        } else {
            self.inner.state()
        }
    }

    fn duration(&self) -> Option<f64> {
        self.inner.duration()
    }

    fn fps(&self) -> Option<f64> {
        self.inner.fps()
    }

    fn current_time(&self) -> f64 {
        self.inner.current_time()
    }

    async fn seek(&mut self, seconds: f64) -> Result<(), VisionError> {
        self.inner.seek(seconds).await
    }

    async fn capture(&mut self) -> Result<Frame, VisionError> {
        self.inner.capture().await
    }
}

#[tokio::test(start_paused = true)]
async fn pause_during_inference_discards_result() {
    let engine = Arc::new(ScriptedEngine::always(accident_output(0.9)).with_delay(Duration::from_millis(100)));
    let mut session = ready_session(engine.clone(), DetectionConfig::default()).await;
    // Refresh ticks land at 96 and 112 ms; the pause falls between the
    // last tick and the inference finishing at 100 ms.
    let mut source = PausesAt {
        inner: FrameSequence::new(frames(30), 30.0).unwrap(),
        pause_at: Instant::now() + Duration::from_millis(97),
    };
    let (tx, mut rx) = mpsc::channel(8);

    let summary = session.run_live(&mut source, &tx, &StopHandle::new()).await.unwrap();

    assert_eq!(summary.end, LiveEnd::Paused);
    assert_eq!(engine.calls(), 1);
    assert_eq!(summary.updates_published, 0);
    assert!(rx.try_recv().is_err());
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn inference_failures_are_skipped_and_reported() {
    let engine = Arc::new(ScriptedEngine::new(vec![
        Ok(empty_output()),
        Err("device lost".into()),
        Ok(empty_output()),
    ]));
    let mut session = ready_session(engine.clone(), DetectionConfig::default()).await;
    let mut source = FrameSequence::new(frames(3), 30.0).unwrap();
    let (tx, mut rx) = mpsc::channel(8);

    let summary = session.run_live(&mut source, &tx, &StopHandle::new()).await.unwrap();

    assert_eq!(summary.frames_processed, 2);
    assert_eq!(summary.frames_skipped, 1);
    assert_eq!(summary.end, LiveEnd::Ended);

    let statuses: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok())
        .map(|u| u.status.to_string())
        .collect();
    assert_eq!(
        statuses,
        vec![
            "No Accident Detected".to_string(),
            "⚠ inference failed: device lost".to_string(),
            "No Accident Detected".to_string(),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn dropped_receiver_ends_loop() {
    let engine = Arc::new(ScriptedEngine::always(empty_output()));
    let mut session = ready_session(engine, DetectionConfig::default()).await;
    let mut source = FrameSequence::new(frames(10), 30.0).unwrap();
    let (tx, rx) = mpsc::channel(8);
    drop(rx);

    let summary = session.run_live(&mut source, &tx, &StopHandle::new()).await.unwrap();
    assert_eq!(summary.end, LiveEnd::Disconnected);
}

#[tokio::test]
async fn backend_fallback_then_image_detection() {
    let engine = Arc::new(ScriptedEngine::new(vec![Ok(classifier_output(75.0))]));
    let loader = FakeLoader::new(engine, vec![ExecutionBackend::Cpu]);
    let mut session = DetectionSession::new(DetectionConfig::default()).unwrap();

    session
        .load(&loader, Path::new("best.onnx"), &EngineOptions::default())
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Ready);
    assert_eq!(
        *loader.attempts.lock().unwrap(),
        vec![ExecutionBackend::Cuda, ExecutionBackend::CoreMl, ExecutionBackend::Cpu]
    );

    let frame = Frame::filled(1280, 720, [10, 10, 10]).unwrap();
    let update = session.detect_image(&frame).await.unwrap();
    assert_eq!(update.status.to_string(), "Accident Detected (75.0%)");
    assert_eq!(update.detections.len(), 1);
    assert!((update.detections[0].width - 432.0).abs() < 1e-3);
}

#[tokio::test]
async fn failed_model_load_returns_to_idle() {
    let engine = Arc::new(ScriptedEngine::always(empty_output()));
    let loader = FakeLoader::new(engine, vec![]);
    let mut session = DetectionSession::new(DetectionConfig::default()).unwrap();

    let err = session
        .load(&loader, Path::new("missing.onnx"), &EngineOptions::default())
        .await
        .unwrap_err();

    assert!(err.is_fatal());
    assert_eq!(session.state(), SessionState::Idle);
    // The loader's own message reaches the user, after the conservative retry
    assert_eq!(
        OverallStatus::from_error(&err).to_string(),
        "Model Loading Failed: cpu: cpu provider not available"
    );
    assert_eq!(
        *loader.attempts.lock().unwrap(),
        vec![
            ExecutionBackend::Cuda,
            ExecutionBackend::CoreMl,
            ExecutionBackend::Cpu,
            ExecutionBackend::Cpu
        ]
    );

    let mut source = FrameSequence::new(frames(2), 30.0).unwrap();
    let (tx, _rx) = mpsc::channel(1);
    let result = session.run_live(&mut source, &tx, &StopHandle::new()).await;
    assert!(matches!(result, Err(VisionError::InvalidState(_))));
}

fn classifier_output(raw: f32) -> accident_vision::vision::OutputTensor {
    accident_vision::vision::OutputTensor {
        name: "output0".into(),
        dims: vec![1, 1],
        data: vec![raw],
    }
}
