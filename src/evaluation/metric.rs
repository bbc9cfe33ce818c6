use crate::error::ShapeError;
use crate::segmentation::Mask;

/// Intersection-over-union between a prediction and ground truth
///
/// Averages over every class except `background_class`; for single-object
/// masks that is the foreground IoU. Classes absent from both maps are
/// skipped, and when nothing is left the result is `None` (undefined).
#[derive(Debug, Clone, Copy)]
pub struct IouScorer {
    background_class: u8,
}

impl Default for IouScorer {
    fn default() -> Self {
        Self::new(0)
    }
}

impl IouScorer {
    const CLASSES: [u8; 2] = [0, 1];

    pub fn new(background_class: u8) -> Self {
        Self { background_class }
    }

    pub fn iou(&self, prediction: &Mask, ground_truth: &Mask) -> Result<Option<f64>, ShapeError> {
        if (prediction.width(), prediction.height()) != (ground_truth.width(), ground_truth.height()) {
            return Err(ShapeError::Dimensions {
                what: "prediction",
                expected_width: ground_truth.width(),
                expected_height: ground_truth.height(),
                width: prediction.width(),
                height: prediction.height(),
            });
        }

        let mut total = 0.0;
        let mut counted = 0usize;
        for class in Self::CLASSES.into_iter().filter(|&c| c != self.background_class) {
            let (mut intersection, mut union) = (0usize, 0usize);
            for (&p, &g) in prediction.labels().iter().zip(ground_truth.labels().iter()) {
                let (p, g) = (p == class, g == class);
                intersection += usize::from(p && g);
                union += usize::from(p || g);
            }
            if union > 0 {
                total += intersection as f64 / union as f64;
                counted += 1;
            }
        }

        Ok((counted > 0).then(|| total / counted as f64))
    }
}
