use super::types::{Mask, PreparedImage};
use crate::config::Normalization;
use image::{imageops, RgbImage};
use ndarray::Array3;

/// Converts raw RGB frames to normalized CHW tensors at network resolution
#[derive(Debug, Clone, Copy)]
pub struct FramePreprocessor {
    target_width: u32,
    target_height: u32,
    normalization: Normalization,
}

impl FramePreprocessor {
    pub fn new(target_width: u32, target_height: u32, normalization: Normalization) -> Self {
        Self {
            target_width,
            target_height,
            normalization,
        }
    }

    /// (width, height) of the network input
    pub fn network_size(&self) -> (usize, usize) {
        (self.target_width as usize, self.target_height as usize)
    }

    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    /// Preprocess an RGB image into a normalized [3, height, width] tensor
    ///
    /// Steps:
    /// 1. Resize to target dimensions (triangle filter, averages when shrinking)
    /// 2. Normalize per `Normalization`
    /// 3. Transpose from HWC to CHW
    pub fn prepare(&self, image: &RgbImage) -> PreparedImage {
        let _span = tracing::debug_span!("preprocess").entered();

        let original_size = image.dimensions();
        let resized = self.resize_image(image);

        let (width, height) = resized.dimensions();
        let mut tensor = Array3::<f32>::zeros((3, height as usize, width as usize));

        for (x, y, pixel) in resized.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            let [r, g, b] = pixel.0.map(f32::from);
            match self.normalization {
                Normalization::UnitScale => {
                    tensor[[0, y, x]] = r / 255.0;
                    tensor[[1, y, x]] = g / 255.0;
                    tensor[[2, y, x]] = b / 255.0;
                }
                Normalization::MeanSubtracted => {
                    let [mb, mg, mr] = Normalization::BGR_MEAN;
                    tensor[[0, y, x]] = b - mb;
                    tensor[[1, y, x]] = g - mg;
                    tensor[[2, y, x]] = r - mr;
                }
            }
        }

        PreparedImage {
            tensor,
            original_size,
        }
    }

    /// Bring a mask to network resolution with nearest-neighbour sampling
    pub fn prepare_mask(&self, mask: &Mask) -> Mask {
        let (width, height) = self.network_size();
        mask.resize_nearest(width, height)
    }

    pub fn resize_image(&self, image: &RgbImage) -> RgbImage {
        if image.dimensions() != (self.target_width, self.target_height) {
            imageops::resize(
                image,
                self.target_width,
                self.target_height,
                imageops::FilterType::Triangle,
            )
        } else {
            image.clone()
        }
    }
}
