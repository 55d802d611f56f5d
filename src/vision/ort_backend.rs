use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider,
    DirectMLExecutionProvider, ExecutionProviderDispatch,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, instrument};

use super::{
    BackendLoader, EngineOptions, ExecutionBackend, InferenceEngine, InputTensor, OutputTensor,
    TensorInfo, VisionError,
};

// Manual From impl to sanitize ORT errors raised while running a model
impl From<ort::Error> for VisionError {
    fn from(e: ort::Error) -> Self {
        // Log full error internally, return sanitized version externally
        tracing::error!(error = %e, "ORT error");
        VisionError::Inference("internal inference error".into())
    }
}

fn provider(backend: ExecutionBackend) -> ExecutionProviderDispatch {
    match backend {
        ExecutionBackend::Cuda => CUDAExecutionProvider::default().build().error_on_failure(),
        ExecutionBackend::CoreMl => CoreMLExecutionProvider::default().build().error_on_failure(),
        ExecutionBackend::DirectMl => {
            DirectMLExecutionProvider::default().build().error_on_failure()
        }
        ExecutionBackend::Cpu => CPUExecutionProvider::default().build(),
    }
}

fn optimization_level(level: u8) -> GraphOptimizationLevel {
    match level {
        0 => GraphOptimizationLevel::Disable,
        1 => GraphOptimizationLevel::Level1,
        2 => GraphOptimizationLevel::Level2,
        _ => GraphOptimizationLevel::Level3,
    }
}

/// Session construction failures keep the runtime's message: it is the only
/// hint the user gets about a missing file or an unusable provider.
fn load_error(path: &Path) -> impl Fn(ort::Error) -> VisionError + '_ {
    move |e| VisionError::ModelLoad {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

fn tensor_dims(dims: impl Iterator<Item = i64>) -> Vec<Option<usize>> {
    dims.map(|d| usize::try_from(d).ok().filter(|&d| d > 0))
        .collect()
}

/// Loads `.onnx` models through ONNX Runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct OrtLoader;

#[async_trait]
impl BackendLoader for OrtLoader {
    async fn try_backend(
        &self,
        path: &Path,
        backend: ExecutionBackend,
        options: &EngineOptions,
    ) -> Result<Arc<dyn InferenceEngine>, VisionError> {
        let path_for_error = path.to_path_buf();
        let path = path.to_path_buf();
        let options = options.clone();

        // Session creation reads and optimizes the model graph; keep it off the async workers
        let engine = tokio::task::spawn_blocking(move || OrtEngine::build(&path, backend, &options))
            .await
            .map_err(|e| VisionError::ModelLoad {
                path: path_for_error.display().to_string(),
                reason: format!("loader task failed: {e}"),
            })??;

        Ok(Arc::new(engine))
    }
}

/// An ONNX Runtime session bound to one execution backend.
///
/// # Thread Safety
///
/// `Session::run` needs exclusive access, so the session sits behind a
/// mutex and every call runs on the blocking pool.
pub struct OrtEngine {
    session: Arc<Mutex<Session>>,
    backend: ExecutionBackend,
    inputs: Vec<TensorInfo>,
    outputs: Vec<TensorInfo>,
}

impl OrtEngine {
    #[instrument(skip(options), fields(path = %path.display()))]
    fn build(
        path: &Path,
        backend: ExecutionBackend,
        options: &EngineOptions,
    ) -> Result<Self, VisionError> {
        let load_error = load_error(path);
        let mut builder = Session::builder()
            .map_err(&load_error)?
            .with_optimization_level(optimization_level(options.optimization_level))
            .map_err(&load_error)?;
        if let Some(threads) = options.intra_threads {
            builder = builder.with_intra_threads(threads).map_err(&load_error)?;
        }
        let session = builder
            .with_execution_providers([provider(backend)])
            .map_err(&load_error)?
            .commit_from_file(path)
            .map_err(&load_error)?;

        let inputs: Vec<TensorInfo> = session
            .inputs
            .iter()
            .map(|input| {
                let dims = input
                    .input_type
                    .tensor_dimensions()
                    .map(tensor_dims)
                    .unwrap_or_default();
                TensorInfo::new(input.name.clone(), dims)
            })
            .collect();

        let outputs: Vec<TensorInfo> = session
            .outputs
            .iter()
            .map(|output| {
                let dims = output
                    .output_type
                    .tensor_dimensions()
                    .map(tensor_dims)
                    .unwrap_or_default();
                TensorInfo::new(output.name.clone(), dims)
            })
            .collect();

        if inputs.is_empty() {
            return Err(VisionError::ModelLoad {
                path: path.display().to_string(),
                reason: "model declares no inputs".into(),
            });
        }

        debug!(%backend, ?inputs, ?outputs, "ORT session ready");

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            backend,
            inputs,
            outputs,
        })
    }
}

#[async_trait]
impl InferenceEngine for OrtEngine {
    fn backend(&self) -> ExecutionBackend {
        self.backend
    }

    fn inputs(&self) -> &[TensorInfo] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorInfo] {
        &self.outputs
    }

    async fn run(
        &self,
        input_name: &str,
        tensor: InputTensor,
    ) -> Result<Vec<OutputTensor>, VisionError> {
        let session = Arc::clone(&self.session);
        let input_name = input_name.to_string();

        tokio::task::spawn_blocking(move || {
            let value = Tensor::from_array((tensor.shape, tensor.data.into_boxed_slice()))?;

            // Acquire lock for thread-safe inference
            let mut session = session
                .lock()
                .map_err(|_| VisionError::Inference("session lock poisoned".into()))?;

            let outputs = session.run(ort::inputs![input_name.as_str() => value])?;

            let mut tensors = Vec::with_capacity(outputs.len());
            for (name, value) in outputs.iter() {
                let (shape, data) = value.try_extract_tensor::<f32>()?;
                let dims = shape
                    .iter()
                    .map(|&d| {
                        usize::try_from(d).map_err(|_| VisionError::InvalidOutputShape {
                            expected: "non-negative dimensions".into(),
                            got: format!("{:?}", &shape[..]),
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                tensors.push(OutputTensor {
                    name: name.to_string(),
                    dims,
                    data: data.to_vec(),
                });
            }
            Ok::<_, VisionError>(tensors)
        })
        .await
        .map_err(|e| VisionError::Inference(format!("inference task failed: {e}")))?
    }
}
