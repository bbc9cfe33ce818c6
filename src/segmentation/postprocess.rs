use super::types::{Mask, Prediction, ScoreMap};
use crate::error::ShapeError;
use image::{imageops, ImageBuffer, Luma};
use ndarray::{Array2, Array3};

type LabelImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Turns a raw score map into a binary prediction at original resolution
#[derive(Debug, Clone, Copy)]
pub struct PredictionPostprocessor {
    foreground_class: usize,
}

impl Default for PredictionPostprocessor {
    fn default() -> Self {
        Self::new(1)
    }
}

impl PredictionPostprocessor {
    pub const THRESHOLD: f32 = 0.5;

    pub fn new(foreground_class: usize) -> Self {
        Self { foreground_class }
    }

    /// Upsample, argmax, resize back and binarize
    ///
    /// # Arguments
    /// * `scores` - Model output, possibly at reduced stride
    /// * `network_size` - (width, height) of the model input
    /// * `original_size` - (width, height) of the source frame
    pub fn postprocess(
        &self,
        scores: &ScoreMap,
        network_size: (usize, usize),
        original_size: (u32, u32),
    ) -> Result<Prediction, ShapeError> {
        let _span = tracing::debug_span!("postprocess").entered();

        if self.foreground_class >= scores.classes() {
            return Err(ShapeError::Channels {
                what: "score map",
                expected: self.foreground_class + 1,
                actual: scores.classes(),
            });
        }

        let (net_w, net_h) = network_size;
        let upsampled;
        let scores = if (scores.width(), scores.height()) != network_size {
            upsampled = upsample_bilinear(scores.scores(), net_w, net_h);
            &upsampled
        } else {
            scores.scores()
        };

        let network = Mask::new(self.argmax(scores))?;
        let original = resize_and_threshold(&network, original_size);

        Ok(Prediction { network, original })
    }

    /// 1 where the foreground class wins, ties go to the lower class index
    fn argmax(&self, scores: &Array3<f32>) -> Array2<u8> {
        let (classes, height, width) = scores.dim();
        Array2::from_shape_fn((height, width), |(y, x)| {
            let mut best = 0;
            for c in 1..classes {
                if scores[[c, y, x]] > scores[[best, y, x]] {
                    best = c;
                }
            }
            u8::from(best == self.foreground_class)
        })
    }
}

/// Bilinear upsampling with aligned corners, per class
fn upsample_bilinear(scores: &Array3<f32>, width: usize, height: usize) -> Array3<f32> {
    let (classes, src_h, src_w) = scores.dim();
    let scale = |src: usize, dst: usize| {
        if dst > 1 {
            (src - 1) as f32 / (dst - 1) as f32
        } else {
            0.0
        }
    };
    let (sy, sx) = (scale(src_h, height), scale(src_w, width));

    Array3::from_shape_fn((classes, height, width), |(c, y, x)| {
        let fy = y as f32 * sy;
        let fx = x as f32 * sx;
        let (y0, x0) = (fy.floor() as usize, fx.floor() as usize);
        let (y1, x1) = ((y0 + 1).min(src_h - 1), (x0 + 1).min(src_w - 1));
        let (dy, dx) = (fy - y0 as f32, fx - x0 as f32);

        let top = scores[[c, y0, x0]] * (1.0 - dx) + scores[[c, y0, x1]] * dx;
        let bottom = scores[[c, y1, x0]] * (1.0 - dx) + scores[[c, y1, x1]] * dx;
        top * (1.0 - dy) + bottom * dy
    })
}

/// Linear resize of the label map, then values above 0.5 become foreground
fn resize_and_threshold(labels: &Mask, (width, height): (u32, u32)) -> Mask {
    if (labels.width(), labels.height()) == (width as usize, height as usize) {
        return labels.clone();
    }

    let label_image = LabelImage::from_fn(labels.width() as u32, labels.height() as u32, |x, y| {
        Luma([f32::from(labels.labels()[[y as usize, x as usize]])])
    });
    let resized = imageops::resize(&label_image, width, height, imageops::FilterType::Triangle);

    let binary = Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
        u8::from(resized.get_pixel(x as u32, y as u32)[0] > PredictionPostprocessor::THRESHOLD)
    });
    Mask::from_binary(binary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn block_scores(width: usize, height: usize, x0: usize, x1: usize, y0: usize, y1: usize) -> ScoreMap {
        let scores = Array3::from_shape_fn((2, height, width), |(c, y, x)| {
            let inside = (x0..x1).contains(&x) && (y0..y1).contains(&y);
            if (c == 1) == inside {
                1.0
            } else {
                0.0
            }
        });
        ScoreMap::new(scores).unwrap()
    }

    #[test]
    fn test_same_resolution_is_plain_argmax() {
        let scores = block_scores(10, 10, 2, 5, 3, 7);
        let prediction = PredictionPostprocessor::default()
            .postprocess(&scores, (10, 10), (10, 10))
            .unwrap();
        assert_eq!(prediction.network.foreground_count(), 12);
        assert_eq!(prediction.original, prediction.network);
    }

    #[test]
    fn test_ties_resolve_to_background() {
        let scores = ScoreMap::new(Array3::zeros((2, 4, 4))).unwrap();
        let prediction = PredictionPostprocessor::default()
            .postprocess(&scores, (4, 4), (4, 4))
            .unwrap();
        assert!(prediction.network.is_empty());
    }

    #[test]
    fn test_upsampled_to_network_then_original() {
        // Score map at half the network stride
        let scores = block_scores(8, 8, 2, 6, 2, 6);
        let prediction = PredictionPostprocessor::default()
            .postprocess(&scores, (15, 15), (30, 30))
            .unwrap();
        assert_eq!(prediction.network.width(), 15);
        assert_eq!(prediction.original.width(), 30);
        assert_eq!(prediction.original.height(), 30);
        assert!(prediction.network.get(7, 7));
        assert!(!prediction.network.get(0, 0));
    }

    #[test]
    fn test_upscale_threshold_keeps_block_edges() {
        // A 5x5 block at network size 50 maps to the 10x10 block at 100
        let scores = block_scores(50, 50, 20, 25, 20, 25);
        let prediction = PredictionPostprocessor::default()
            .postprocess(&scores, (50, 50), (100, 100))
            .unwrap();
        let original = &prediction.original;
        assert_eq!(original.foreground_count(), 100);
        assert!(original.get(40, 40));
        assert!(original.get(49, 49));
        assert!(!original.get(39, 45));
        assert!(!original.get(50, 45));
    }

    #[test]
    fn test_missing_foreground_class_rejected() {
        let scores = block_scores(4, 4, 0, 1, 0, 1);
        assert!(PredictionPostprocessor::new(2)
            .postprocess(&scores, (4, 4), (4, 4))
            .is_err());
    }
}
