use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{
    decode, preprocess, suppress, DecodeContext, Detection, InferenceEngine, OutputLayout,
    VisionError,
};
use crate::config::DetectionConfig;
use crate::frame::Frame;

/// Everything learned from one frame, before temporal stabilization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[must_use]
pub struct FrameAnalysis {
    /// Post-NMS detections in source pixels, highest confidence first.
    pub detections: Vec<Detection>,
    pub layout: OutputLayout,
    pub score: f32,
    pub is_accident: bool,
    /// True if NMS input was capped
    pub truncated: bool,
    pub candidates_before_nms: usize,
    pub preprocess_ms: f64,
    pub inference_ms: f64,
    pub postprocess_ms: f64,
}

/// Preprocess, run, decode, suppress and filter a single frame.
///
/// Holds a shared engine handle; one pipeline serves a whole session.
#[derive(Clone)]
pub struct DetectionPipeline {
    engine: Arc<dyn InferenceEngine>,
    config: DetectionConfig,
    input_name: String,
    input_size: (u32, u32),
}

impl std::fmt::Debug for DetectionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectionPipeline")
            .field("backend", &self.engine.backend())
            .field("input_name", &self.input_name)
            .field("input_size", &self.input_size)
            .finish_non_exhaustive()
    }
}

impl DetectionPipeline {
    pub fn new(engine: Arc<dyn InferenceEngine>, config: DetectionConfig) -> Result<Self, VisionError> {
        config.validate()?;
        let input_name = engine
            .input_name()
            .ok_or_else(|| VisionError::Config("model declares no inputs".into()))?
            .to_string();
        let input_size = engine.input_size();

        Ok(Self {
            engine,
            config,
            input_name,
            input_size,
        })
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub fn input_size(&self) -> (u32, u32) {
        self.input_size
    }

    #[instrument(skip_all, fields(width = frame.width(), height = frame.height()))]
    pub async fn analyze(&self, frame: &Frame) -> Result<FrameAnalysis, VisionError> {
        let (model_w, model_h) = self.input_size;

        let preprocess_start = Instant::now();
        let (tensor, transform) = preprocess(frame, model_w, model_h)?;
        let preprocess_ms = preprocess_start.elapsed().as_secs_f64() * 1000.0;

        let inference_start = Instant::now();
        let outputs = self.engine.run(&self.input_name, tensor).await?;
        let inference_ms = inference_start.elapsed().as_secs_f64() * 1000.0;
        histogram!("detection.inference.duration_ms").record(inference_ms);

        let postprocess_start = Instant::now();
        let output = outputs.first().ok_or_else(|| VisionError::InvalidOutputShape {
            expected: "at least one output tensor".into(),
            got: "none".into(),
        })?;

        let ctx = DecodeContext::letterboxed(frame.natural_size(), self.input_size, transform);
        let decoded = decode(output, &ctx, &self.config)?;

        let (detections, truncated, candidates_before_nms) = if decoded.layout.is_whole_frame() {
            // Synthesized box, already gated by the classification cutoff
            let count = decoded.detections.len();
            (decoded.detections, false, count)
        } else {
            self.postprocess(decoded.detections)
        };
        let postprocess_ms = postprocess_start.elapsed().as_secs_f64() * 1000.0;

        let (is_accident, score) = if decoded.layout.is_whole_frame() {
            (decoded.is_accident, decoded.score)
        } else {
            let best = detections.first().map_or(0.0, |d| d.confidence);
            (!detections.is_empty(), best)
        };

        counter!("detection.frames.processed").increment(1);
        debug!(
            detections = detections.len(),
            layout = ?decoded.layout,
            truncated,
            candidates_before_nms,
            preprocess_ms,
            inference_ms,
            postprocess_ms,
            "frame analyzed"
        );

        Ok(FrameAnalysis {
            detections,
            layout: decoded.layout,
            score,
            is_accident,
            truncated,
            candidates_before_nms,
            preprocess_ms,
            inference_ms,
            postprocess_ms,
        })
    }

    /// NMS plus the display filter. Returns (kept, was_truncated, candidates_before_nms).
    fn postprocess(&self, mut candidates: Vec<Detection>) -> (Vec<Detection>, bool, usize) {
        let candidates_before_nms = candidates.len();
        let limit = self.config.max_nms_inputs;

        let truncated = candidates.len() > limit;
        if truncated {
            warn!(original = candidates.len(), limit, "NMS input truncated");
            candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
            candidates.truncate(limit);
        }

        let min_side = self.config.min_box_side;
        let detections = suppress(candidates, self.config.iou_threshold)
            .into_iter()
            .filter(|d| {
                d.confidence > self.config.confidence_threshold
                    && d.width > min_side
                    && d.height > min_side
            })
            .take(self.config.max_detections)
            .collect();

        (detections, truncated, candidates_before_nms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::{ExecutionBackend, InputTensor, OutputTensor, TensorInfo};
    use async_trait::async_trait;

    /// Returns the same output for every frame and records input shapes.
    struct FixedEngine {
        inputs: Vec<TensorInfo>,
        output: OutputTensor,
        seen: std::sync::Mutex<Vec<[usize; 4]>>,
    }

    impl FixedEngine {
        fn new(dims: &[usize], data: Vec<f32>) -> Arc<Self> {
            Arc::new(Self {
                inputs: vec![TensorInfo::new("images", [Some(1), Some(3), Some(640), Some(640)])],
                output: OutputTensor {
                    name: "output0".into(),
                    dims: dims.to_vec(),
                    data,
                },
                seen: std::sync::Mutex::new(vec![]),
            })
        }
    }

    #[async_trait]
    impl InferenceEngine for FixedEngine {
        fn backend(&self) -> ExecutionBackend {
            ExecutionBackend::Cpu
        }

        fn inputs(&self) -> &[TensorInfo] {
            &self.inputs
        }

        fn outputs(&self) -> &[TensorInfo] {
            &[]
        }

        async fn run(&self, name: &str, tensor: InputTensor) -> Result<Vec<OutputTensor>, VisionError> {
            assert_eq!(name, "images");
            self.seen.lock().unwrap().push(tensor.shape);
            Ok(vec![self.output.clone()])
        }
    }

    fn frame() -> Frame {
        Frame::filled(1280, 720, [40, 40, 40]).unwrap()
    }

    #[tokio::test]
    async fn anchors_are_mapped_suppressed_and_filtered() {
        #[rustfmt::skip]
        let data = vec![
            320.0, 320.0, 100.0, 50.0, 0.9, 1.0,
            321.0, 321.0, 100.0, 50.0, 0.8, 1.0, // duplicate
            100.0, 200.0,   4.0,  4.0, 0.9, 1.0, // too small after mapping
        ];
        let engine = FixedEngine::new(&[1, 3, 6], data);
        let pipeline = DetectionPipeline::new(engine.clone(), DetectionConfig::default()).unwrap();

        let analysis = pipeline.analyze(&frame()).await.unwrap();

        assert_eq!(*engine.seen.lock().unwrap(), vec![[1, 3, 640, 640]]);
        assert_eq!(analysis.candidates_before_nms, 3);
        assert!(!analysis.truncated);
        assert!(analysis.is_accident);
        assert_eq!(analysis.detections.len(), 1);

        let det = &analysis.detections[0];
        assert!((det.x - 540.0).abs() < 1e-3);
        assert!((det.y - 310.0).abs() < 1e-3);
        assert!((analysis.score - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn classification_output_yields_whole_frame_box() {
        let engine = FixedEngine::new(&[1, 1], vec![75.0]);
        let pipeline = DetectionPipeline::new(engine, DetectionConfig::default()).unwrap();

        let analysis = pipeline.analyze(&frame()).await.unwrap();
        assert_eq!(analysis.layout, OutputLayout::SingleScore);
        assert!(analysis.is_accident);
        assert!((analysis.score - 0.75).abs() < 1e-6);
        assert_eq!(analysis.detections.len(), 1);
    }

    #[tokio::test]
    async fn whole_frame_box_survives_on_tiny_frames() {
        let engine = FixedEngine::new(&[1, 1], vec![0.9]);
        let pipeline = DetectionPipeline::new(engine, DetectionConfig::default()).unwrap();
        // Synthesized side is well under min_box_side here
        let tiny = Frame::filled(20, 16, [40, 40, 40]).unwrap();

        let analysis = pipeline.analyze(&tiny).await.unwrap();
        assert!(analysis.is_accident);
        assert_eq!(analysis.detections.len(), 1);
        assert!(analysis.detections[0].width < DetectionConfig::default().min_box_side);
    }

    #[tokio::test]
    async fn nms_input_is_capped() {
        let data: Vec<f32> = (0..20)
            .flat_map(|i| [40.0 + 30.0 * i as f32, 320.0, 20.0, 20.0, 0.5 + i as f32 * 0.01])
            .collect();
        let engine = FixedEngine::new(&[1, 20, 5], data);
        let config = DetectionConfig {
            max_nms_inputs: 8,
            ..DetectionConfig::default()
        };
        let pipeline = DetectionPipeline::new(engine, config).unwrap();

        let analysis = pipeline.analyze(&frame()).await.unwrap();
        assert!(analysis.truncated);
        assert_eq!(analysis.candidates_before_nms, 20);
        assert_eq!(analysis.detections.len(), 5);
        assert!(analysis.detections[0].confidence > analysis.detections[4].confidence);
    }

    #[tokio::test]
    async fn empty_model_output_is_frame_local() {
        let engine = FixedEngine::new(&[1, 0], vec![]);
        let pipeline = DetectionPipeline::new(engine, DetectionConfig::default()).unwrap();

        let err = pipeline.analyze(&frame()).await.unwrap_err();
        assert!(matches!(err, VisionError::InvalidOutputShape { .. }));
        assert!(err.is_frame_local());
    }

    #[test]
    fn rejects_invalid_config() {
        let engine = FixedEngine::new(&[1, 1], vec![0.9]);
        let config = DetectionConfig::default().with_iou_threshold(2.0);
        assert!(matches!(
            DetectionPipeline::new(engine, config),
            Err(VisionError::Config(_))
        ));
    }
}
