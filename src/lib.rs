//! Mask-propagation evaluation for single-object video segmentation.
//!
//! Frame 0 of every sequence is seeded from ground truth; each later frame
//! is guided by the model's own previous prediction. Per-sequence mean IoU
//! and the dataset mean-of-means are collected into an [`EvaluationReport`].

pub mod config;
pub mod error;
pub mod evaluation;
pub mod output;
pub mod segmentation;
pub mod source;

pub use config::EvalConfig;
pub use error::EvalError;
pub use evaluation::{EvaluationAggregator, EvaluationReport, SequencePropagator, SequenceResult};
