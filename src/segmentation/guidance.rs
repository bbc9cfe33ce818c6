use super::types::{GuidanceSignal, Mask};
use crate::config::SeedingPolicy;
use crate::error::ShapeError;

/// Builds the guidance channel from a ground-truth mask or a prior prediction
///
/// Seeding and propagation share one policy so a run cannot mix them.
#[derive(Debug, Clone, Copy)]
pub struct GuidanceSynthesizer {
    policy: SeedingPolicy,
    magnitude: f32,
}

impl GuidanceSynthesizer {
    pub fn new(policy: SeedingPolicy, magnitude: f32) -> Self {
        Self { policy, magnitude }
    }

    pub fn policy(&self) -> SeedingPolicy {
        self.policy
    }

    pub fn magnitude(&self) -> f32 {
        self.magnitude
    }

    /// Guidance for frame 0, from ground truth already at network resolution
    pub fn seed(&self, ground_truth: &Mask, shape: (usize, usize)) -> Result<GuidanceSignal, ShapeError> {
        if ground_truth.is_empty() {
            tracing::warn!("Seed ground truth has no foreground, guidance starts all-low");
        }
        self.synthesize("seed ground truth", ground_truth, shape)
    }

    /// Guidance for frame k > 0, from the network-resolution prediction of frame k - 1
    ///
    /// An empty prior collapses to all-low: the model gets no positional cue.
    pub fn propagate(&self, prior: &Mask, shape: (usize, usize)) -> Result<GuidanceSignal, ShapeError> {
        self.synthesize("prior prediction", prior, shape)
    }

    fn synthesize(
        &self,
        what: &'static str,
        source: &Mask,
        (width, height): (usize, usize),
    ) -> Result<GuidanceSignal, ShapeError> {
        if (source.width(), source.height()) != (width, height) {
            return Err(ShapeError::Dimensions {
                what,
                expected_width: width,
                expected_height: height,
                width: source.width(),
                height: source.height(),
            });
        }

        let mut signal = GuidanceSignal::all_low(width, height, self.magnitude);
        let rect = match source.bounding_box() {
            Some(rect) if !rect.is_degenerate() => rect,
            _ => return Ok(signal),
        };

        match self.policy {
            SeedingPolicy::BoundingBox => signal.raise_rect(rect),
            SeedingPolicy::ExactMask => {
                for ((y, x), &label) in source.labels().indexed_iter() {
                    if label == 1 {
                        signal.raise(x, y);
                    }
                }
            }
        }
        Ok(signal)
    }
}
