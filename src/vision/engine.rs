use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::{InputTensor, VisionError};
use crate::DEFAULT_INPUT_SIZE;

// ============================================================================
// Engine options
// ============================================================================

/// Execution backends, tried in the order listed in [`EngineOptions::backends`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionBackend {
    Cuda,
    CoreMl,
    DirectMl,
    Cpu,
}

impl fmt::Display for ExecutionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionBackend::Cuda => "cuda",
            ExecutionBackend::CoreMl => "coreml",
            ExecutionBackend::DirectMl => "directml",
            ExecutionBackend::Cpu => "cpu",
        };
        f.write_str(name)
    }
}

/// Engine settings handed to the loader at initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Preference order; the first backend that initializes wins.
    pub backends: Vec<ExecutionBackend>,
    /// Graph optimization level, 0 (off) to 3 (all).
    pub optimization_level: u8,
    pub intra_threads: Option<usize>,
    /// After every listed backend fails, make one last attempt with
    /// [`EngineOptions::conservative`].
    pub fallback_to_defaults: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            backends: vec![
                ExecutionBackend::Cuda,
                ExecutionBackend::CoreMl,
                ExecutionBackend::Cpu,
            ],
            optimization_level: 3,
            intra_threads: None,
            fallback_to_defaults: true,
        }
    }
}

impl EngineOptions {
    pub fn cpu_only() -> Self {
        Self {
            backends: vec![ExecutionBackend::Cpu],
            ..Self::default()
        }
    }

    /// CPU only, basic graph optimization, runtime-chosen threading.
    pub fn conservative() -> Self {
        Self {
            backends: vec![ExecutionBackend::Cpu],
            optimization_level: 1,
            intra_threads: None,
            fallback_to_defaults: false,
        }
    }

    pub fn with_default_fallback(mut self, enabled: bool) -> Self {
        self.fallback_to_defaults = enabled;
        self
    }

    pub fn with_backends(mut self, backends: impl IntoIterator<Item = ExecutionBackend>) -> Self {
        self.backends = backends.into_iter().collect();
        self
    }

    pub fn with_intra_threads(mut self, threads: usize) -> Self {
        self.intra_threads = Some(threads);
        self
    }
}

// ============================================================================
// Tensors
// ============================================================================

/// Declared tensor metadata; `None` marks a dynamic dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorInfo {
    pub name: String,
    pub dims: Vec<Option<usize>>,
}

impl TensorInfo {
    pub fn new(name: impl Into<String>, dims: impl IntoIterator<Item = Option<usize>>) -> Self {
        Self {
            name: name.into(),
            dims: dims.into_iter().collect(),
        }
    }
}

/// One materialized output tensor, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor {
    pub name: String,
    pub dims: Vec<usize>,
    pub data: Vec<f32>,
}

// ============================================================================
// Engine seams
// ============================================================================

/// A loaded model. Calls to `run` are serialized by the implementation.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    fn backend(&self) -> ExecutionBackend;

    fn inputs(&self) -> &[TensorInfo];

    fn outputs(&self) -> &[TensorInfo];

    /// Model input `(width, height)` from the first input's trailing dims,
    /// 640x640 when the shape is missing or dynamic.
    fn input_size(&self) -> (u32, u32) {
        let declared = self.inputs().first().and_then(|input| match input.dims[..] {
            [.., Some(h), Some(w)] if h > 0 && w > 0 => {
                Some((u32::try_from(w).ok()?, u32::try_from(h).ok()?))
            }
            _ => None,
        });
        declared.unwrap_or((DEFAULT_INPUT_SIZE, DEFAULT_INPUT_SIZE))
    }

    fn input_name(&self) -> Option<&str> {
        self.inputs().first().map(|input| input.name.as_str())
    }

    async fn run(
        &self,
        input_name: &str,
        tensor: InputTensor,
    ) -> Result<Vec<OutputTensor>, VisionError>;
}

/// Initializes a model on one specific backend.
#[async_trait]
pub trait BackendLoader: Send + Sync {
    async fn try_backend(
        &self,
        path: &Path,
        backend: ExecutionBackend,
        options: &EngineOptions,
    ) -> Result<Arc<dyn InferenceEngine>, VisionError>;
}

/// Loads a model, walking the backend preference list until one initializes,
/// then falling back to conservative CPU settings if enabled.
///
/// # Errors
///
/// `ModelLoad` carrying the last backend's error when every backend fails.
#[instrument(skip(loader, options), fields(path = %path.display()))]
pub async fn load_model(
    loader: &dyn BackendLoader,
    path: &Path,
    options: &EngineOptions,
) -> Result<Arc<dyn InferenceEngine>, VisionError> {
    let mut last_error = String::from("no execution backends configured");

    let conservative = EngineOptions::conservative();
    let fallback = options
        .fallback_to_defaults
        .then_some((ExecutionBackend::Cpu, &conservative));
    let attempts = options
        .backends
        .iter()
        .map(|&backend| (backend, options))
        .chain(fallback);

    for (backend, attempt_options) in attempts {
        match loader.try_backend(path, backend, attempt_options).await {
            Ok(engine) => {
                info!(%backend, input_size = ?engine.input_size(), "model loaded");
                return Ok(engine);
            }
            Err(e) => {
                warn!(%backend, error = %e, "backend failed to initialize, trying next");
                counter!("detection.model.backend_failures").increment(1);
                let reason = match e {
                    VisionError::ModelLoad { reason, .. } => reason,
                    other => other.to_string(),
                };
                last_error = format!("{backend}: {reason}");
            }
        }
    }

    Err(VisionError::ModelLoad {
        path: path.display().to_string(),
        reason: last_error,
    })
}
