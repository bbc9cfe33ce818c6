use crate::error::{ModelError, ShapeError};
use image::{GrayImage, Luma};
use ndarray::{s, Array2, Array3, Array4};

/// Binary object mask: 1 = foreground, 0 = background, indexed [y, x]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    labels: Array2<u8>,
}

impl Mask {
    /// Wrap a label map, rejecting anything other than 0 and 1
    pub fn new(labels: Array2<u8>) -> Result<Self, ShapeError> {
        if labels.is_empty() {
            return Err(ShapeError::Empty { what: "mask" });
        }
        if let Some(&bad) = labels.iter().find(|&&v| v > 1) {
            return Err(ShapeError::InvalidLabel(bad));
        }
        Ok(Self { labels })
    }

    /// Caller guarantees every label is 0 or 1
    pub(crate) fn from_binary(labels: Array2<u8>) -> Self {
        debug_assert!(labels.iter().all(|&v| v <= 1));
        Self { labels }
    }

    pub fn background(width: usize, height: usize) -> Self {
        Self {
            labels: Array2::zeros((height, width)),
        }
    }

    /// Decode an annotation image: 255 is the object, every other value is background
    pub fn from_annotation(annotation: &GrayImage) -> Self {
        let (width, height) = annotation.dimensions();
        let labels = Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
            u8::from(annotation.get_pixel(x as u32, y as u32)[0] == 255)
        });
        Self { labels }
    }

    pub fn width(&self) -> usize {
        self.labels.ncols()
    }

    pub fn height(&self) -> usize {
        self.labels.nrows()
    }

    pub fn labels(&self) -> &Array2<u8> {
        &self.labels
    }

    pub fn get(&self, x: usize, y: usize) -> bool {
        self.labels[[y, x]] == 1
    }

    pub fn foreground_count(&self) -> usize {
        self.labels.iter().filter(|&&v| v == 1).count()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.iter().all(|&v| v == 0)
    }

    /// Tight bounding rectangle of the foreground, `None` when there is none
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        let mut bounds: Option<(usize, usize, usize, usize)> = None;
        for ((y, x), &v) in self.labels.indexed_iter() {
            if v == 0 {
                continue;
            }
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }
        bounds.map(|(x0, y0, x1, y1)| BoundingBox {
            x: x0,
            y: y0,
            width: x1 - x0 + 1,
            height: y1 - y0 + 1,
        })
    }

    /// Nearest-neighbour resize; never introduces new label values
    pub fn resize_nearest(&self, width: usize, height: usize) -> Self {
        if (width, height) == (self.width(), self.height()) {
            return self.clone();
        }
        let (src_w, src_h) = (self.width(), self.height());
        let labels = Array2::from_shape_fn((height, width), |(y, x)| {
            let sy = (y * src_h / height).min(src_h - 1);
            let sx = (x * src_w / width).min(src_w - 1);
            self.labels[[sy, sx]]
        });
        Self { labels }
    }

    /// Visual form for dumping: foreground 255, background 0
    pub fn to_image(&self) -> GrayImage {
        GrayImage::from_fn(self.width() as u32, self.height() as u32, |x, y| {
            Luma([self.labels[[y as usize, x as usize]] * 255])
        })
    }
}

/// Axis-aligned rectangle in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl BoundingBox {
    pub fn is_degenerate(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// One-channel spatial prior at network resolution, two admissible values
#[derive(Debug, Clone, PartialEq)]
pub struct GuidanceSignal {
    values: Array2<f32>,
    low: f32,
    high: f32,
}

impl GuidanceSignal {
    /// All pixels "low": no positional belief
    pub fn all_low(width: usize, height: usize, magnitude: f32) -> Self {
        Self {
            values: Array2::from_elem((height, width), -magnitude),
            low: -magnitude,
            high: magnitude,
        }
    }

    pub(crate) fn raise(&mut self, x: usize, y: usize) {
        self.values[[y, x]] = self.high;
    }

    pub(crate) fn raise_rect(&mut self, rect: BoundingBox) {
        let high = self.high;
        self.values
            .slice_mut(s![rect.y..rect.y + rect.height, rect.x..rect.x + rect.width])
            .fill(high);
    }

    pub fn width(&self) -> usize {
        self.values.ncols()
    }

    pub fn height(&self) -> usize {
        self.values.nrows()
    }

    pub fn values(&self) -> &Array2<f32> {
        &self.values
    }

    pub fn low(&self) -> f32 {
        self.low
    }

    pub fn high(&self) -> f32 {
        self.high
    }

    pub fn is_high(&self, x: usize, y: usize) -> bool {
        self.values[[y, x]] == self.high
    }

    pub fn is_all_low(&self) -> bool {
        self.values.iter().all(|&v| v == self.low)
    }

    pub fn high_count(&self) -> usize {
        self.values.iter().filter(|&&v| v == self.high).count()
    }
}

/// Image resized to network resolution and normalized, channels first
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub tensor: Array3<f32>,
    /// (width, height) before resizing
    pub original_size: (u32, u32),
}

impl PreparedImage {
    pub fn width(&self) -> usize {
        self.tensor.shape()[2]
    }

    pub fn height(&self) -> usize {
        self.tensor.shape()[1]
    }
}

/// The 4-channel (1, 4, H, W) tensor handed to the model
#[derive(Debug, Clone)]
pub struct ModelInput {
    tensor: Array4<f32>,
}

impl ModelInput {
    pub const CHANNELS: usize = 4;

    /// Stack image channels and the guidance channel
    pub fn assemble(image: &PreparedImage, guidance: &GuidanceSignal) -> Result<Self, ShapeError> {
        let channels = image.tensor.shape()[0];
        if channels != Self::CHANNELS - 1 {
            return Err(ShapeError::Channels {
                what: "prepared image",
                expected: Self::CHANNELS - 1,
                actual: channels,
            });
        }
        let (width, height) = (image.width(), image.height());
        if (guidance.width(), guidance.height()) != (width, height) {
            return Err(ShapeError::Dimensions {
                what: "guidance signal",
                expected_width: width,
                expected_height: height,
                width: guidance.width(),
                height: guidance.height(),
            });
        }

        let mut tensor = Array4::<f32>::zeros((1, Self::CHANNELS, height, width));
        tensor.slice_mut(s![0, 0..3, .., ..]).assign(&image.tensor);
        tensor.slice_mut(s![0, 3, .., ..]).assign(guidance.values());
        Ok(Self { tensor })
    }

    pub fn tensor(&self) -> &Array4<f32> {
        &self.tensor
    }

    pub fn width(&self) -> usize {
        self.tensor.shape()[3]
    }

    pub fn height(&self) -> usize {
        self.tensor.shape()[2]
    }
}

/// Raw per-class scores, indexed [class, y, x]
#[derive(Debug, Clone)]
pub struct ScoreMap {
    scores: Array3<f32>,
}

impl ScoreMap {
    pub fn new(scores: Array3<f32>) -> Result<Self, ShapeError> {
        let classes = scores.shape()[0];
        if classes < 2 {
            return Err(ShapeError::TooFewClasses(classes));
        }
        if scores.shape()[1] == 0 || scores.shape()[2] == 0 {
            return Err(ShapeError::Empty { what: "score map" });
        }
        Ok(Self { scores })
    }

    /// Accept a batched (1, classes, h, w) model output
    pub fn from_batch(batch: Array4<f32>) -> Result<Self, ModelError> {
        let shape = batch.shape().to_vec();
        if shape[0] != 1 || shape[1] < 2 || shape[2] == 0 || shape[3] == 0 {
            return Err(ModelError::OutputShape { actual: shape });
        }
        let scores = batch.index_axis_move(ndarray::Axis(0), 0);
        Ok(Self { scores })
    }

    pub fn classes(&self) -> usize {
        self.scores.shape()[0]
    }

    pub fn width(&self) -> usize {
        self.scores.shape()[2]
    }

    pub fn height(&self) -> usize {
        self.scores.shape()[1]
    }

    pub fn scores(&self) -> &Array3<f32> {
        &self.scores
    }
}

/// Binarized model output at both resolutions
#[derive(Debug, Clone)]
pub struct Prediction {
    /// Label map at network resolution; the prior for the next frame
    pub network: Mask,
    /// Label map at original resolution; what gets scored
    pub original: Mask,
}

/// Black-box forward pass
///
/// Allows swapping between backends (ONNX Runtime, test stubs, ...)
pub trait InferenceAdapter {
    /// Run one (1, 4, H, W) input and return the per-class score map
    fn infer(&mut self, input: &ModelInput) -> Result<ScoreMap, ModelError>;

    /// Fixed network input size as (width, height), if the backend knows it
    fn input_size(&self) -> Option<(u32, u32)> {
        None
    }
}

impl<M: InferenceAdapter + ?Sized> InferenceAdapter for Box<M> {
    fn infer(&mut self, input: &ModelInput) -> Result<ScoreMap, ModelError> {
        (**self).infer(input)
    }

    fn input_size(&self) -> Option<(u32, u32)> {
        (**self).input_size()
    }
}
