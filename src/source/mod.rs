mod davis;

pub use davis::DavisSource;

use crate::error::ResourceError;
use crate::segmentation::Mask;
use image::RgbImage;
use std::fmt;

/// Position of a frame inside its sequence
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameId {
    pub sequence: String,
    pub index: usize,
    /// File stem, used for dumps and error context
    pub name: String,
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} (#{})", self.sequence, self.name, self.index)
    }
}

/// A decoded frame at original resolution
#[derive(Debug, Clone)]
pub struct Frame {
    pub id: FrameId,
    pub image: RgbImage,
    /// Absent for inference-only frames
    pub ground_truth: Option<Mask>,
}

/// Trait for annotated video datasets
pub trait SequenceSource {
    /// All sequence identifiers the source knows about
    fn sequence_ids(&self) -> Result<Vec<String>, ResourceError>;

    /// Frames of one sequence, in playback order
    fn frames(&self, sequence_id: &str) -> Result<Vec<FrameId>, ResourceError>;

    /// Decode one frame and its annotation
    fn load_frame(&self, id: &FrameId) -> Result<Frame, ResourceError>;
}
