mod guidance;
#[cfg(feature = "onnx")]
mod onnx;
mod postprocess;
mod preprocess;
pub mod types;

pub use guidance::GuidanceSynthesizer;
#[cfg(feature = "onnx")]
pub use onnx::OnnxSegmenter;
pub use postprocess::PredictionPostprocessor;
pub use preprocess::FramePreprocessor;
pub use types::{
    BoundingBox, GuidanceSignal, InferenceAdapter, Mask, ModelInput, Prediction, PreparedImage,
    ScoreMap,
};

use anyhow::Result;

/// Load the ONNX backend for the configured network size
#[cfg(feature = "onnx")]
pub fn create_default_model(
    model_path: &str,
    input_size: (u32, u32),
    output_index: usize,
    intra_threads: usize,
) -> Result<Box<dyn InferenceAdapter + Send>> {
    let model = OnnxSegmenter::new(model_path, input_size, output_index, intra_threads)?;
    Ok(Box::new(model))
}

#[cfg(not(feature = "onnx"))]
pub fn create_default_model(
    model_path: &str,
    _input_size: (u32, u32),
    _output_index: usize,
    _intra_threads: usize,
) -> Result<Box<dyn InferenceAdapter + Send>> {
    anyhow::bail!(
        "cannot load {}: built without the `onnx` feature",
        model_path
    )
}
