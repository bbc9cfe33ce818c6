use super::metric::IouScorer;
use crate::config::{EvalConfig, UndefinedIouPolicy};
use crate::error::{EvalError, ModelError, ResourceError, ShapeError};
use crate::output::PredictionSink;
use crate::segmentation::{
    FramePreprocessor, GuidanceSignal, GuidanceSynthesizer, InferenceAdapter, ModelInput,
    Prediction, PredictionPostprocessor,
};
use crate::source::{Frame, FrameId, SequenceSource};
use serde::Serialize;
use std::time::{Duration, Instant};

/// Score of one frame after the undefined-IoU policy is applied
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameScore {
    pub index: usize,
    pub name: String,
    /// Whether the frame had ground truth at all
    pub annotated: bool,
    /// `None` when the frame is unannotated or its undefined IoU was excluded
    pub iou: Option<f64>,
}

/// Per-frame IoUs and their mean for one sequence
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceResult {
    pub sequence_id: String,
    pub frames: Vec<FrameScore>,
    /// `None` when no frame of the sequence was scored
    pub mean_iou: Option<f64>,
}

impl SequenceResult {
    pub fn new(sequence_id: impl Into<String>, frames: Vec<FrameScore>) -> Self {
        let scored: Vec<f64> = frames.iter().filter_map(|f| f.iou).collect();
        let mean_iou = (!scored.is_empty()).then(|| scored.iter().sum::<f64>() / scored.len() as f64);
        Self {
            sequence_id: sequence_id.into(),
            frames,
            mean_iou,
        }
    }

    pub fn scored_frames(&self) -> usize {
        self.frames.iter().filter(|f| f.iou.is_some()).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No frame processed; the next one seeds from ground truth
    Start,
    /// Frame 0 done, guidance now comes from its prediction
    Seeded,
    Propagating,
    /// Sequence closed, no state survives
    Done,
}

/// State threaded through a sequence: the one live guidance signal and the scores so far
#[derive(Debug, Clone)]
pub struct Propagation {
    phase: Phase,
    /// Guidance for the next frame, replaced after every frame; `None` only at `Start`
    guidance: Option<GuidanceSignal>,
    scores: Vec<FrameScore>,
}

impl Propagation {
    pub fn start() -> Self {
        Self {
            phase: Phase::Start,
            guidance: None,
            scores: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn guidance(&self) -> Option<&GuidanceSignal> {
        self.guidance.as_ref()
    }

    pub fn scores(&self) -> &[FrameScore] {
        &self.scores
    }

    /// Close the sequence; the guidance is dropped with it
    pub fn finish(self, sequence_id: &str) -> SequenceResult {
        tracing::debug!("{}: {:?} -> {:?}", sequence_id, self.phase, Phase::Done);
        SequenceResult::new(sequence_id, self.scores)
    }
}

/// Drives the per-frame loop of one sequence
pub struct SequencePropagator<'a> {
    preprocessor: FramePreprocessor,
    guidance: GuidanceSynthesizer,
    postprocessor: PredictionPostprocessor,
    scorer: IouScorer,
    undefined_iou: UndefinedIouPolicy,
    max_inference_time: Option<Duration>,
    sink: Option<&'a dyn PredictionSink>,
}

impl<'a> SequencePropagator<'a> {
    pub fn new(
        preprocessor: FramePreprocessor,
        guidance: GuidanceSynthesizer,
        postprocessor: PredictionPostprocessor,
        scorer: IouScorer,
    ) -> Self {
        Self {
            preprocessor,
            guidance,
            postprocessor,
            scorer,
            undefined_iou: UndefinedIouPolicy::default(),
            max_inference_time: None,
            sink: None,
        }
    }

    pub fn from_config(config: &EvalConfig) -> Self {
        let preprocessor =
            FramePreprocessor::new(config.input_width, config.input_height, config.normalization);
        let guidance = GuidanceSynthesizer::new(config.seeding, config.guidance_magnitude());
        Self::new(
            preprocessor,
            guidance,
            PredictionPostprocessor::new(config.foreground_class),
            IouScorer::new(config.background_class),
        )
        .with_undefined_iou(config.undefined_iou)
        .with_max_inference_time(config.max_inference_time())
    }

    pub fn with_undefined_iou(mut self, policy: UndefinedIouPolicy) -> Self {
        self.undefined_iou = policy;
        self
    }

    pub fn with_max_inference_time(mut self, limit: Option<Duration>) -> Self {
        self.max_inference_time = limit;
        self
    }

    pub fn with_sink(mut self, sink: &'a dyn PredictionSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Evaluate one sequence, frames strictly in order
    pub fn run<S, M>(&self, source: &S, sequence_id: &str, model: &mut M) -> Result<SequenceResult, EvalError>
    where
        S: SequenceSource + ?Sized,
        M: InferenceAdapter + ?Sized,
    {
        let _span = tracing::info_span!("sequence", id = sequence_id).entered();

        let frames = source.frames(sequence_id).map_err(|source| EvalError::Resource {
            sequence: sequence_id.to_string(),
            frame: "-".to_string(),
            source,
        })?;
        tracing::debug!("{} frames", frames.len());

        let state = frames.iter().try_fold(Propagation::start(), |state, id| {
            let frame = source
                .load_frame(id)
                .map_err(|source| resource_error(id, source))?;
            self.step(state, &frame, model)
        })?;

        let result = state.finish(sequence_id);
        match result.mean_iou {
            Some(mean) => tracing::info!("{}: mean IoU {:.4}", sequence_id, mean),
            None => tracing::warn!("{}: no frame could be scored", sequence_id),
        }
        Ok(result)
    }

    /// Process one frame and hand back the state for the next
    pub fn step<M>(&self, state: Propagation, frame: &Frame, model: &mut M) -> Result<Propagation, EvalError>
    where
        M: InferenceAdapter + ?Sized,
    {
        let id = &frame.id;
        let network_size = self.preprocessor.network_size();

        if let Some(gt) = &frame.ground_truth {
            let (width, height) = frame.image.dimensions();
            if (gt.width(), gt.height()) != (width as usize, height as usize) {
                return Err(resource_error(
                    id,
                    ResourceError::Annotation(ShapeError::Dimensions {
                        what: "annotation",
                        expected_width: width as usize,
                        expected_height: height as usize,
                        width: gt.width(),
                        height: gt.height(),
                    }),
                ));
            }
        }

        let prepared = self.preprocessor.prepare(&frame.image);

        let guidance = match state.guidance {
            Some(guidance) => guidance,
            None => {
                let gt = frame
                    .ground_truth
                    .as_ref()
                    .ok_or_else(|| resource_error(id, ResourceError::MissingSeed))?;
                let gt = self.preprocessor.prepare_mask(gt);
                self.guidance
                    .seed(&gt, network_size)
                    .map_err(|source| shape_error(id, source))?
            }
        };

        let input = ModelInput::assemble(&prepared, &guidance).map_err(|source| shape_error(id, source))?;
        let prediction = self.predict(&input, network_size, prepared.original_size, model, id)?;

        let iou = match &frame.ground_truth {
            Some(gt) => {
                let raw = self
                    .scorer
                    .iou(&prediction.original, gt)
                    .map_err(|source| shape_error(id, source))?;
                if raw.is_none() {
                    tracing::warn!(
                        "{}: prediction and ground truth both empty, IoU undefined ({:?})",
                        id,
                        self.undefined_iou
                    );
                }
                self.undefined_iou.resolve(raw)
            }
            None => None,
        };
        tracing::debug!("{}: IoU {:?}", id, iou);

        if let Some(sink) = self.sink {
            sink.write_prediction(id, &prediction.original)
                .map_err(|source| EvalError::Dump {
                    sequence: id.sequence.clone(),
                    frame: id.name.clone(),
                    source,
                })?;
        }

        // Frame k + 1 only ever sees what the model predicted on frame k
        let next = self
            .guidance
            .propagate(&prediction.network, network_size)
            .map_err(|source| shape_error(id, source))?;
        if next.is_all_low() {
            tracing::debug!("{}: empty prediction, guidance collapses to all-low", id);
        }

        let mut scores = state.scores;
        scores.push(FrameScore {
            index: id.index,
            name: id.name.clone(),
            annotated: frame.ground_truth.is_some(),
            iou,
        });

        Ok(Propagation {
            phase: match state.phase {
                Phase::Start => Phase::Seeded,
                _ => Phase::Propagating,
            },
            guidance: Some(next),
            scores,
        })
    }

    fn predict<M>(
        &self,
        input: &ModelInput,
        network_size: (usize, usize),
        original_size: (u32, u32),
        model: &mut M,
        id: &FrameId,
    ) -> Result<Prediction, EvalError>
    where
        M: InferenceAdapter + ?Sized,
    {
        let model_error = |source| EvalError::Model {
            sequence: id.sequence.clone(),
            frame: id.name.clone(),
            source,
        };

        let started = Instant::now();
        let scores = {
            let _span = tracing::debug_span!("inference").entered();
            model.infer(input).map_err(model_error)?
        };
        let elapsed = started.elapsed();
        if let Some(limit) = self.max_inference_time {
            if elapsed > limit {
                return Err(model_error(ModelError::Stalled { elapsed, limit }));
            }
        }

        self.postprocessor
            .postprocess(&scores, network_size, original_size)
            .map_err(|source| model_error(ModelError::Backend(source.into())))
    }
}

fn resource_error(id: &FrameId, source: ResourceError) -> EvalError {
    EvalError::Resource {
        sequence: id.sequence.clone(),
        frame: id.name.clone(),
        source,
    }
}

fn shape_error(id: &FrameId, source: ShapeError) -> EvalError {
    EvalError::Shape {
        sequence: id.sequence.clone(),
        frame: id.name.clone(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Normalization, SeedingPolicy};
    use crate::error::ModelError;
    use crate::segmentation::{Mask, ScoreMap};
    use image::RgbImage;
    use ndarray::{Array2, Array3};

    /// Predicts foreground exactly where the guidance is high
    struct EchoGuidance;

    impl InferenceAdapter for EchoGuidance {
        fn infer(&mut self, input: &ModelInput) -> Result<ScoreMap, ModelError> {
            let t = input.tensor();
            let (h, w) = (input.height(), input.width());
            let scores = Array3::from_shape_fn((2, h, w), |(c, y, x)| {
                let high = t[[0, 3, y, x]] > 0.0;
                if (c == 1) == high {
                    1.0
                } else {
                    0.0
                }
            });
            Ok(ScoreMap::new(scores).unwrap())
        }
    }

    fn propagator() -> SequencePropagator<'static> {
        SequencePropagator::new(
            FramePreprocessor::new(20, 20, Normalization::UnitScale),
            GuidanceSynthesizer::new(SeedingPolicy::BoundingBox, 1.0),
            PredictionPostprocessor::default(),
            IouScorer::default(),
        )
    }

    fn frame(index: usize, ground_truth: Option<Mask>) -> Frame {
        Frame {
            id: FrameId {
                sequence: "seq".to_string(),
                index,
                name: format!("{index:05}"),
            },
            image: RgbImage::new(20, 20),
            ground_truth,
        }
    }

    fn square() -> Mask {
        Mask::new(Array2::from_shape_fn((20, 20), |(y, x)| {
            u8::from((5..10).contains(&x) && (5..10).contains(&y))
        }))
        .unwrap()
    }

    #[test]
    fn test_phases_and_guidance_threading() {
        let propagator = propagator();
        let mut model = EchoGuidance;

        let state = Propagation::start();
        assert_eq!(state.phase(), Phase::Start);

        let state = propagator.step(state, &frame(0, Some(square())), &mut model).unwrap();
        assert_eq!(state.phase(), Phase::Seeded);
        assert_eq!(state.guidance().unwrap().high_count(), 25);

        // Ground truth of later frames never reaches the guidance
        let state = propagator
            .step(state, &frame(1, Some(Mask::background(20, 20))), &mut model)
            .unwrap();
        assert_eq!(state.phase(), Phase::Propagating);
        assert_eq!(state.guidance().unwrap().high_count(), 25);
        assert_eq!(state.scores()[1].iou, Some(0.0));

        let result = state.finish("seq");
        assert_eq!(result.mean_iou, Some(0.5));
    }

    #[test]
    fn test_seed_without_ground_truth_is_resource_error() {
        let err = propagator()
            .step(Propagation::start(), &frame(0, None), &mut EchoGuidance)
            .unwrap_err();
        assert!(err.is_resource());
    }

    #[test]
    fn test_unannotated_frames_are_not_scored() {
        let propagator = propagator();
        let mut model = EchoGuidance;
        let state = propagator
            .step(Propagation::start(), &frame(0, Some(square())), &mut model)
            .unwrap();
        let state = propagator.step(state, &frame(1, None), &mut model).unwrap();
        let result = state.finish("seq");
        assert_eq!(result.scored_frames(), 1);
        assert_eq!(result.mean_iou, Some(1.0));
    }

    #[test]
    fn test_undefined_iou_policy() {
        let empty = || Some(Mask::background(20, 20));
        for (policy, expected) in [
            (UndefinedIouPolicy::Exclude, None),
            (UndefinedIouPolicy::CountAsOne, Some(1.0)),
        ] {
            let propagator = propagator().with_undefined_iou(policy);
            let state = propagator
                .step(Propagation::start(), &frame(0, empty()), &mut EchoGuidance)
                .unwrap();
            assert_eq!(state.finish("seq").mean_iou, expected);
        }
    }

    #[test]
    fn test_excluded_frame_distinct_from_unannotated() {
        let propagator = propagator();
        let mut model = EchoGuidance;
        let state = propagator
            .step(Propagation::start(), &frame(0, Some(Mask::background(20, 20))), &mut model)
            .unwrap();
        let state = propagator.step(state, &frame(1, None), &mut model).unwrap();

        let result = state.finish("seq");
        let flags: Vec<_> = result.frames.iter().map(|f| (f.annotated, f.iou)).collect();
        assert_eq!(flags, vec![(true, None), (false, None)]);
        assert_eq!(result.mean_iou, None);
    }

    #[test]
    fn test_annotation_size_mismatch_is_resource_error() {
        let err = propagator()
            .step(
                Propagation::start(),
                &frame(0, Some(Mask::background(10, 10))),
                &mut EchoGuidance,
            )
            .unwrap_err();
        assert!(err.is_resource());
    }

    #[test]
    fn test_stall_is_model_error() {
        struct Slow;
        impl InferenceAdapter for Slow {
            fn infer(&mut self, input: &ModelInput) -> Result<ScoreMap, ModelError> {
                std::thread::sleep(Duration::from_millis(20));
                EchoGuidance.infer(input)
            }
        }

        let err = propagator()
            .with_max_inference_time(Some(Duration::from_millis(1)))
            .step(Propagation::start(), &frame(0, Some(square())), &mut Slow)
            .unwrap_err();
        assert!(matches!(
            err,
            EvalError::Model {
                source: ModelError::Stalled { .. },
                ..
            }
        ));
    }
}
