use super::types::{InferenceAdapter, ModelInput, ScoreMap};
use crate::error::ModelError;
use anyhow::{Context, Result};
use ndarray::Array4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;

/// Four-channel segmentation network served by ONNX Runtime
///
/// Takes image + guidance as a single (1, 4, H, W) input and returns
/// per-class scores from the selected output (multi-scale exports carry
/// several heads).
pub struct OnnxSegmenter {
    session: Session,
    output_index: usize,
    width: u32,
    height: u32,
}

impl OnnxSegmenter {
    /// Create a new model from an ONNX file
    ///
    /// # Arguments
    /// * `model_path` - Path to the ONNX model file
    /// * `input_size` - Fixed network input as (width, height)
    /// * `output_index` - Which model output holds the class scores
    /// * `intra_threads` - ONNX Runtime intra-op thread count
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        input_size: (u32, u32),
        output_index: usize,
        intra_threads: usize,
    ) -> Result<Self> {
        let path = model_path.as_ref();

        tracing::info!("Loading segmentation model from {}", path.display());

        let builder = Session::builder()?;

        #[cfg(feature = "cuda")]
        let builder = {
            tracing::info!("Enabling CUDA execution provider");
            builder.with_execution_providers([
                ort::execution_providers::CUDAExecutionProvider::default().build(),
            ])?
        };

        let session = builder
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads)?
            .commit_from_file(path)
            .with_context(|| format!("Failed to load model from {}", path.display()))?;

        tracing::info!("Segmentation model loaded successfully, scoring output {}", output_index);

        let (width, height) = input_size;
        Ok(Self {
            session,
            output_index,
            width,
            height,
        })
    }

    fn run(&mut self, input: &ModelInput) -> Result<Array4<f32>> {
        let shape = input.tensor().shape().to_vec();
        let data: Vec<f32> = input.tensor().iter().copied().collect();
        let value = Tensor::from_array((shape, data.into_boxed_slice()))?;

        let _infer_span = tracing::debug_span!("inference").entered();
        let outputs = self
            .session
            .run(ort::inputs![value])
            .context("Failed to run inference")?;

        anyhow::ensure!(
            self.output_index < outputs.len(),
            "model output {} requested, model has {} outputs",
            self.output_index,
            outputs.len()
        );
        let (output_shape, scores) = outputs[self.output_index].try_extract_tensor::<f32>()?;
        let dims: Vec<usize> = output_shape.iter().map(|&d| d.max(0) as usize).collect();
        tracing::debug!("Model output shape: {:?}", dims);

        anyhow::ensure!(dims.len() == 4, "expected a 4-d output, got {:?}", dims);
        let batch = Array4::from_shape_vec((dims[0], dims[1], dims[2], dims[3]), scores.to_vec())?;
        Ok(batch)
    }
}

impl InferenceAdapter for OnnxSegmenter {
    fn infer(&mut self, input: &ModelInput) -> Result<ScoreMap, ModelError> {
        let batch = self.run(input)?;
        ScoreMap::from_batch(batch)
    }

    fn input_size(&self) -> Option<(u32, u32)> {
        Some((self.width, self.height))
    }
}
