#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use accident_vision::vision::{
    BackendLoader, EngineOptions, ExecutionBackend, InferenceEngine, InputTensor, OutputTensor,
    TensorInfo,
};
use accident_vision::{DetectionConfig, DetectionSession, Frame, StopHandle, VisionError};
use async_trait::async_trait;

/// Fake model: answers from a script (cycled by call index) after a delay,
/// and records how many runs overlapped.
pub struct ScriptedEngine {
    inputs: Vec<TensorInfo>,
    delay: Duration,
    script: Vec<Result<OutputTensor, String>>,
    stop_on_call: Option<(usize, StopHandle)>,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(script: Vec<Result<OutputTensor, String>>) -> Self {
        Self {
            inputs: vec![TensorInfo::new("images", [Some(1), Some(3), Some(640), Some(640)])],
            delay: Duration::ZERO,
            script,
            stop_on_call: None,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn always(output: OutputTensor) -> Self {
        Self::new(vec![Ok(output)])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fire `stop` while the given call (0-based) is still running.
    pub fn stopping_on_call(mut self, call: usize, stop: StopHandle) -> Self {
        self.stop_on_call = Some((call, stop));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceEngine for ScriptedEngine {
    fn backend(&self) -> ExecutionBackend {
        ExecutionBackend::Cpu
    }

    fn inputs(&self) -> &[TensorInfo] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorInfo] {
        &[]
    }

    async fn run(&self, _input: &str, _tensor: InputTensor) -> Result<Vec<OutputTensor>, VisionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some((stop_call, stop)) = &self.stop_on_call {
            if *stop_call == call {
                stop.stop();
            }
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        match &self.script[call % self.script.len()] {
            Ok(output) => Ok(vec![output.clone()]),
            Err(message) => Err(VisionError::Inference(message.clone())),
        }
    }
}

/// Hands out one shared engine, but only on the listed backends.
pub struct FakeLoader {
    engine: Arc<ScriptedEngine>,
    working: Vec<ExecutionBackend>,
    pub attempts: Mutex<Vec<ExecutionBackend>>,
}

impl FakeLoader {
    pub fn new(engine: Arc<ScriptedEngine>, working: Vec<ExecutionBackend>) -> Self {
        Self {
            engine,
            working,
            attempts: Mutex::new(vec![]),
        }
    }
}

#[async_trait]
impl BackendLoader for FakeLoader {
    async fn try_backend(
        &self,
        path: &Path,
        backend: ExecutionBackend,
        _options: &EngineOptions,
    ) -> Result<Arc<dyn InferenceEngine>, VisionError> {
        self.attempts.lock().unwrap().push(backend);
        if self.working.contains(&backend) {
            Ok(self.engine.clone())
        } else {
            Err(VisionError::ModelLoad {
                path: path.display().to_string(),
                reason: format!("{backend} provider not available"),
            })
        }
    }
}

/// One anchor, features-last, centered in model space.
pub fn accident_output(confidence: f32) -> OutputTensor {
    OutputTensor {
        name: "output0".into(),
        dims: vec![1, 1, 6],
        data: vec![320.0, 320.0, 120.0, 120.0, confidence, 1.0],
    }
}

pub fn empty_output() -> OutputTensor {
    accident_output(0.0)
}

pub fn frames(n: usize) -> Vec<Frame> {
    (0..n)
        .map(|i| Frame::filled(64, 48, [(i % 256) as u8, 80, 80]).unwrap())
        .collect()
}

pub async fn ready_session(engine: Arc<ScriptedEngine>, config: DetectionConfig) -> DetectionSession {
    let loader = FakeLoader::new(engine, vec![ExecutionBackend::Cpu]);
    let mut session = DetectionSession::new(config).unwrap();
    session
        .load(&loader, Path::new("best.onnx"), &EngineOptions::cpu_only())
        .await
        .unwrap();
    session
}
