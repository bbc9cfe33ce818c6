mod aggregator;
mod metric;
mod propagator;

pub use aggregator::{EvaluationAggregator, EvaluationReport, SkippedSequence};
pub use metric::IouScorer;
pub use propagator::{FrameScore, Phase, Propagation, SequencePropagator, SequenceResult};
